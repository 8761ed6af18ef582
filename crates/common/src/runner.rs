//! Orchestrator: loads a specification and executes its invokes in order

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::expect::{Expectation, InvokeCondition, Severity, Verdict};
use crate::invoker::{CallRequest, Invoker};
use crate::registry::{Invoke, InvokeRegistry};
use crate::report::{Diagnostic, RunObserver, RunOutcome, RunReport, SourceExcerpt};
use crate::syntax::{EndpointDecl, EntryKind, Position, SpecFile, TestMeta};

/// Language version this runner understands
pub const SUPPORTED_VERSION: &str = "v0.0.1";

/// Schema inputs declared by the specification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaImports {
    pub import_paths: Vec<String>,
    pub proto_files: Vec<String>,
    pub proto_sets: Vec<String>,
}

impl SchemaImports {
    pub fn is_empty(&self) -> bool {
        self.proto_files.is_empty() && self.proto_sets.is_empty()
    }
}

/// A loaded specification, ready to execute
#[derive(Debug)]
pub struct TestPlan {
    pub meta: TestMeta,
    pub imports: SchemaImports,
    spec: SpecFile,
    endpoints: HashMap<String, EndpointDecl>,
    registry: InvokeRegistry,
}

impl TestPlan {
    /// Build the endpoint table and invoke registry.
    ///
    /// Every specification error that can be found without a network call is
    /// raised here.
    pub fn load(spec: &SpecFile) -> Result<Self> {
        let mut entries = spec.entries.iter();
        let meta = match entries.next() {
            Some(entry) => match &entry.kind {
                EntryKind::Metadata(meta) if !meta.name.trim().is_empty() => {
                    for (keyword, seconds) in [("maxtime", meta.max_time), ("timeout", meta.timeout)] {
                        if Duration::try_from_secs_f64(seconds).is_err() {
                            return Err(Error::syntax(
                                &entry.pos,
                                format!("{keyword} must be a non-negative number of seconds, got {seconds}"),
                            ));
                        }
                    }
                    meta.clone()
                }
                _ => return Err(Error::syntax(&entry.pos, "Be kind and name your test")),
            },
            None => {
                let pos = Position { filename: spec.filename.clone(), line: 1, column: 1 };
                return Err(Error::syntax(&pos, "Be kind and name your test"));
            }
        };
        if meta.version != SUPPORTED_VERSION {
            warn!("Test \"{}\" declares trpc version {}, expected {}", meta.name, meta.version, SUPPORTED_VERSION);
        }

        let mut imports = SchemaImports::default();
        let mut endpoints = HashMap::new();
        let mut registry = InvokeRegistry::new();

        for entry in entries {
            match &entry.kind {
                EntryKind::Metadata(_) => {
                    return Err(Error::syntax(&entry.pos, "Test metadata must be the first statement"));
                }
                EntryKind::ImportPath(path) => imports.import_paths.push(path.clone()),
                EntryKind::ImportProtoFile(file) => imports.proto_files.push(file.clone()),
                EntryKind::ImportProtoSet(file) => imports.proto_sets.push(file.clone()),
                EntryKind::Endpoint(endpoint) => {
                    if let Some(previous) = endpoints.insert(endpoint.name.clone(), endpoint.clone()) {
                        debug!("Endpoint {} at {} replaces the one at {}", endpoint.name, endpoint.pos, previous.pos);
                    }
                }
                EntryKind::Invoke(decl) => {
                    let expectations = decl
                        .expects
                        .iter()
                        .map(Expectation::compile)
                        .collect::<Result<Vec<_>>>()?;
                    registry.insert(Invoke::new(decl.clone(), expectations))?;
                }
            }
        }

        // every name is known before resolving, so a later invoke reads as not ready
        for position in 0..registry.len() {
            registry.resolve_request(position, false)?;
            for expectation in &registry.at(position).expectations {
                expectation.check_references(&registry, position)?;
            }
        }

        debug!(
            "Loaded test \"{}\": {} endpoint(s), {} invoke(s)",
            meta.name,
            endpoints.len(),
            registry.len()
        );

        Ok(Self { meta, imports, spec: spec.clone(), endpoints, registry })
    }

    pub fn registry(&self) -> &InvokeRegistry {
        &self.registry
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointDecl> {
        self.endpoints.get(name)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointDecl> {
        self.endpoints.values()
    }

    /// The offending line for a position in this plan's source
    pub fn excerpt(&self, pos: &Position) -> SourceExcerpt {
        SourceExcerpt::new(&self.spec, pos)
    }

    /// Run every invoke in declaration order.
    ///
    /// `Err` is a fatal error (specification or operational); a Panic-severity
    /// failure ends the run early with a failed [`RunReport`].
    pub async fn execute<I, O>(&mut self, invoker: &mut I, observer: &mut O) -> Result<RunReport>
    where
        I: Invoker + ?Sized,
        O: RunObserver + ?Sized,
    {
        let deadline = (self.meta.max_time > 0.0)
            .then(|| Duration::try_from_secs_f64(self.meta.max_time).ok())
            .flatten()
            .and_then(|max_time| Instant::now().checked_add(max_time));

        info!("Running test \"{}\" with {} invoke(s)", self.meta.name, self.registry.len());
        observer.run_started(&self.meta);

        let mut report = RunReport {
            test_name: self.meta.name.clone(),
            outcome: RunOutcome::Passed,
            warnings: 0,
            ignores: 0,
            invokes_executed: 0,
            stats: invoker.stats(),
        };

        for position in 0..self.registry.len() {
            let endpoint = self.lookup_endpoint(position)?;
            observer.invoke_started(self.registry.at(position), &self.meta);

            if self.registry.at(position).contains_references {
                debug!("Resolving references of invoke {}", self.registry.at(position).name());
                self.registry.resolve_request(position, true)?;
            }

            let outcome = {
                let invoke = self.registry.at(position);
                let request = CallRequest {
                    endpoint: &endpoint,
                    service: &invoke.decl.service,
                    method: &invoke.decl.rpc,
                    headers: &invoke.request_headers,
                    data: &invoke.request_data,
                    deadline,
                };
                debug!("Dispatching {} to {}", request.symbol(), endpoint.target());
                invoker.invoke(request).await?
            };
            report.invokes_executed += 1;
            report.stats = invoker.stats();

            let invoke = self.registry.at_mut(position);
            invoke.capture(outcome.primary_response(), outcome.status.clone());
            observer.call_completed(self.registry.at(position), &outcome, report.stats, self.meta.verbose);

            if let Some(failed) = self.evaluate(position, observer, &mut report)? {
                report.outcome = failed;
                observer.finished(&report);
                return Ok(report);
            }
        }

        observer.finished(&report);
        Ok(report)
    }

    fn lookup_endpoint(&self, position: usize) -> Result<EndpointDecl> {
        let invoke = self.registry.at(position);
        self.endpoints.get(&invoke.decl.endpoint).cloned().ok_or_else(|| {
            let mut known: Vec<String> = self.endpoints.keys().cloned().collect();
            known.sort();
            Error::UnknownEndpoint {
                invoke: invoke.name().to_string(),
                endpoint: invoke.decl.endpoint.clone(),
                known,
                pos: invoke.pos().clone(),
            }
        })
    }

    /// Check every expectation of the invoke at `position`; a Panic failure
    /// yields the outcome that ends the run.
    fn evaluate<O>(&mut self, position: usize, observer: &mut O, report: &mut RunReport) -> Result<Option<RunOutcome>>
    where
        O: RunObserver + ?Sized,
    {
        let expectations = self.registry.at(position).expectations.clone();
        for expectation in expectations {
            let Verdict::Fail(message) = expectation.evaluate(&self.registry, position)? else {
                continue;
            };

            let invoke = self.registry.at(position);
            let diagnostic = Diagnostic {
                severity: expectation.severity,
                test_name: self.meta.name.clone(),
                description: self.meta.description.clone(),
                invoke: invoke.name().to_string(),
                goal: invoke.decl.goal.clone(),
                message: message.clone(),
                excerpt: self.excerpt(&expectation.pos),
            };
            let code = invoke.status.as_ref().map(|s| s.code).unwrap_or(tonic::Code::Ok);
            let severity = expectation.severity;
            debug!("Expectation {} {} failed on {} ({})", expectation.subject, expectation.function, invoke.name(), severity);

            self.registry
                .at_mut(position)
                .conditions
                .push(InvokeCondition { severity, expectation, message });
            observer.condition_recorded(&diagnostic);

            match severity {
                Severity::Panic => {
                    return Ok(Some(RunOutcome::Failed { invoke: diagnostic.invoke, code }));
                }
                Severity::Warn => report.warnings += 1,
                Severity::Ignore => report.ignores += 1,
            }
        }
        Ok(None)
    }
}

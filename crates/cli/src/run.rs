//! Specification discovery and the per-file run loop

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use trpc_common::error::EXIT_OPERATIONAL;
use trpc_common::syntax::{self, Position};
use trpc_common::{Error, Result, RunOutcome, RunReport, SourceExcerpt, TestPlan};
use trpc_grpc::GrpcInvoker;

use crate::config::RunnerConfig;
use crate::output::{print_error, render_error, ConsoleReporter};

/// File extension of specification files
pub const SPEC_EXTENSION: &str = "trpc";

/// Expand the given paths into specification files.
///
/// Files are taken as given; directories are walked recursively for
/// `*.trpc` files, sorted by path.
pub fn collect_specs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut specs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| p.extension().is_some_and(|ext| ext == SPEC_EXTENSION))
                .collect();
            found.sort();
            debug!("Found {} specification(s) under {}", found.len(), path.display());
            specs.extend(found);
        } else if path.is_file() {
            specs.push(path.clone());
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
    }
    Ok(specs)
}

/// Run every file in order, stopping at the first that does not pass
pub async fn run_all(files: &[PathBuf], config: &RunnerConfig) -> i32 {
    for file in files {
        let code = run_file(file, config).await;
        if code != 0 {
            return code;
        }
    }
    0
}

/// Run one specification file and return its exit code
pub async fn run_file(path: &Path, config: &RunnerConfig) -> i32 {
    info!("Running specification {}", path.display());
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            print_error(&format!("Could not read {}: {e}", path.display()));
            return EXIT_OPERATIONAL;
        }
    };

    let spec = match syntax::parse(&path.display().to_string(), &source) {
        Ok(spec) => spec,
        Err(err) => {
            let excerpt = err.position().map(|pos| excerpt_from_source(&source, pos));
            return fail(&err, excerpt.as_ref());
        }
    };

    let mut plan = match TestPlan::load(&spec) {
        Ok(plan) => plan,
        Err(err) => {
            let excerpt = err.position().map(|pos| SourceExcerpt::new(&spec, pos));
            return fail(&err, excerpt.as_ref());
        }
    };

    match execute(&mut plan, config).await {
        Ok(report) => {
            if let RunOutcome::Failed { invoke, code } = &report.outcome {
                debug!("Test \"{}\" failed at invoke {} with status {:?}", report.test_name, invoke, code);
            }
            report.exit_code(config.status_exit_code)
        }
        Err(err) => {
            let excerpt = err.position().map(|pos| plan.excerpt(pos));
            fail(&err, excerpt.as_ref())
        }
    }
}

async fn execute(plan: &mut TestPlan, config: &RunnerConfig) -> Result<RunReport> {
    for endpoint in plan.endpoints() {
        config.check_endpoint(endpoint)?;
    }
    plan.meta.max_time = config.max_time_for(&plan.meta);
    let settings = config.invoker_settings(&plan.meta)?;

    let mut invoker = GrpcInvoker::for_imports(settings, &plan.imports)?;
    let mut reporter = ConsoleReporter::new();
    let result = plan.execute(&mut invoker, &mut reporter).await;
    invoker.close();
    result
}

fn fail(err: &Error, excerpt: Option<&SourceExcerpt>) -> i32 {
    print_error(&render_error(err, excerpt));
    err.exit_code()
}

/// Excerpt for errors raised before a [`syntax::SpecFile`] exists
fn excerpt_from_source(source: &str, pos: &Position) -> SourceExcerpt {
    let text = pos
        .line
        .checked_sub(1)
        .and_then(|idx| source.lines().nth(idx))
        .unwrap_or("");
    SourceExcerpt { pos: pos.clone(), text: text.to_string() }
}

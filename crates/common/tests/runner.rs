//! Orchestrator scenarios against a scripted in-memory invoker

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tonic::Code;

use trpc_common::report::Diagnostic;
use trpc_common::value::ResolveError;
use trpc_common::{
    syntax, CallOutcome, CallRequest, CallStatus, Error, Fields, InvokeStats, Invoker, Result, RunObserver,
    RunOutcome, RunReport, Severity, TestPlan, Value,
};

/// Replies with canned outcomes per `service/method` and records requests
#[derive(Default)]
struct ScriptedInvoker {
    replies: HashMap<String, VecDeque<CallOutcome>>,
    calls: Vec<(String, Fields, Vec<(String, String)>)>,
    stats: InvokeStats,
}

impl ScriptedInvoker {
    fn reply(mut self, symbol: &str, status: CallStatus, response: serde_json::Value) -> Self {
        let Value::Map(fields) = Value::from_json(response) else {
            panic!("response must be an object");
        };
        self.replies.entry(symbol.to_string()).or_default().push_back(CallOutcome {
            status,
            responses: vec![fields],
            response_headers: Vec::new(),
            trailers: Vec::new(),
            requests_sent: 1,
        });
        self
    }

    fn called(&self) -> Vec<&str> {
        self.calls.iter().map(|(symbol, _, _)| symbol.as_str()).collect()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&mut self, request: CallRequest<'_>) -> Result<CallOutcome> {
        let symbol = request.symbol();
        self.calls.push((symbol.clone(), request.data.clone(), request.headers.to_vec()));
        let outcome = self
            .replies
            .get_mut(&symbol)
            .and_then(VecDeque::pop_front)
            .unwrap_or(CallOutcome {
                status: CallStatus::ok(),
                responses: Vec::new(),
                response_headers: Vec::new(),
                trailers: Vec::new(),
                requests_sent: 1,
            });
        self.stats.record(&outcome);
        Ok(outcome)
    }

    fn stats(&self) -> InvokeStats {
        self.stats
    }
}

#[derive(Default)]
struct Recorder {
    started: Vec<String>,
    diagnostics: Vec<Diagnostic>,
    finished: Option<RunReport>,
}

impl RunObserver for Recorder {
    fn invoke_started(&mut self, invoke: &trpc_common::Invoke, _meta: &syntax::TestMeta) {
        self.started.push(invoke.name().to_string());
    }

    fn condition_recorded(&mut self, diagnostic: &Diagnostic) {
        self.diagnostics.push(diagnostic.clone());
    }

    fn finished(&mut self, report: &RunReport) {
        self.finished = Some(report.clone());
    }
}

const HEADER: &str = "test \"auth\" desc \"login flow\" trpc \"v0.0.1\"\nendpoint svc \"localhost\" port 50051\n";

fn plan(body: &str) -> Result<TestPlan> {
    let source = format!("{HEADER}{body}");
    let spec = syntax::parse("auth.trpc", &source)?;
    TestPlan::load(&spec)
}

async fn run(body: &str, invoker: &mut ScriptedInvoker) -> (RunReport, Recorder) {
    let mut plan = plan(body).unwrap();
    let mut recorder = Recorder::default();
    let report = plan.execute(invoker, &mut recorder).await.unwrap();
    (report, recorder)
}

#[tokio::test]
async fn test_no_expectations_passes() {
    let mut invoker = ScriptedInvoker::default();
    let (report, recorder) = run("invoke ping svc health.Health Check\n", &mut invoker).await;

    assert!(report.passed());
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(report.invokes_executed, 1);
    assert_eq!(recorder.started, vec!["ping"]);
    assert!(recorder.finished.is_some());
}

#[tokio::test]
async fn test_login_token_flows_into_later_invoke() {
    let body = r#"
invoke login svc auth.v1.Auth Login
    data { user: "a", pass: "b" }
    expects { code isOk() }
invoke whoAmI svc auth.v1.Auth WhoAmI
    headers { "x-trace": "1" }
    data { token: login.response.token, user: login.data.user }
    expects { response.name isEqual(login.data.user) }
"#;
    let mut invoker = ScriptedInvoker::default()
        .reply("auth.v1.Auth/Login", CallStatus::ok(), serde_json::json!({ "token": "xyz" }))
        .reply("auth.v1.Auth/WhoAmI", CallStatus::ok(), serde_json::json!({ "name": "a" }));
    let (report, recorder) = run(body, &mut invoker).await;

    assert!(report.passed(), "{:?}", recorder.diagnostics);
    assert_eq!(invoker.called(), vec!["auth.v1.Auth/Login", "auth.v1.Auth/WhoAmI"]);
    let (_, data, headers) = &invoker.calls[1];
    assert_eq!(data.get("token"), Some(&Value::from("xyz")));
    assert_eq!(data.get("user"), Some(&Value::from("a")));
    assert_eq!(headers, &vec![("x-trace".to_string(), "1".to_string())]);
    assert_eq!(report.stats, InvokeStats { requests_sent: 2, responses_received: 2 });
}

#[tokio::test]
async fn test_missing_field_reports_not_found() {
    let body = "invoke login svc auth.v1.Auth Login\n    expects { response.token isEqual(\"xyz\") }\n";
    let mut invoker =
        ScriptedInvoker::default().reply("auth.v1.Auth/Login", CallStatus::ok(), serde_json::json!({ "id": 1 }));
    let (report, recorder) = run(body, &mut invoker).await;

    assert!(!report.passed());
    assert_eq!(recorder.diagnostics.len(), 1);
    let diagnostic = &recorder.diagnostics[0];
    assert_eq!(diagnostic.message, "Field token not found on Login");
    assert_eq!(diagnostic.excerpt.pos.line, 4);
    assert!(diagnostic.excerpt.text.contains("response.token"));
}

#[tokio::test]
async fn test_warn_failure_continues_and_exits_zero() {
    let body = r#"
invoke login svc auth.v1.Auth Login
    expects { response.token isEqual("xyz") onFail Warn }
invoke logout svc auth.v1.Auth Logout
    expects { code isOk() message isEmpty() onFail Ignore }
"#;
    let mut invoker = ScriptedInvoker::default()
        .reply("auth.v1.Auth/Login", CallStatus::ok(), serde_json::json!({ "token": "abc" }))
        .reply("auth.v1.Auth/Logout", CallStatus::new(Code::Ok, "bye"), serde_json::json!({}));
    let (report, recorder) = run(body, &mut invoker).await;

    assert!(report.passed());
    assert_eq!(report.warnings, 1);
    assert_eq!(report.ignores, 1);
    assert_eq!(report.exit_code(true), 0);
    assert_eq!(invoker.called().len(), 2);
    assert_eq!(recorder.diagnostics[0].severity, Severity::Warn);
    assert_eq!(recorder.diagnostics[1].severity, Severity::Ignore);
}

#[tokio::test]
async fn test_panic_failure_stops_the_run() {
    let body = r#"
invoke login svc auth.v1.Auth Login
    goal "reject bad password"
    expects { code isOk() }
invoke whoAmI svc auth.v1.Auth WhoAmI
"#;
    let mut invoker = ScriptedInvoker::default().reply(
        "auth.v1.Auth/Login",
        CallStatus::new(Code::Unauthenticated, "bad password"),
        serde_json::json!({}),
    );
    let (report, recorder) = run(body, &mut invoker).await;

    assert_eq!(report.outcome, RunOutcome::Failed { invoke: "login".into(), code: Code::Unauthenticated });
    assert_eq!(report.exit_code(false), 3);
    assert_eq!(report.exit_code(true), 64 + 16);
    assert_eq!(invoker.called(), vec!["auth.v1.Auth/Login"]);
    assert_eq!(recorder.diagnostics[0].goal.as_deref(), Some("reject bad password"));
    assert_eq!(
        recorder.diagnostics[0].message,
        "Response code expected to be (OK) but got (Unauthenticated)"
    );
}

#[tokio::test]
async fn test_failed_call_status_is_checkable() {
    let body = "invoke get svc store.Store Get\n    expects { code isNotFound() message isEqual(\"no such key\") }\n";
    let mut invoker = ScriptedInvoker::default().reply(
        "store.Store/Get",
        CallStatus::new(Code::NotFound, "no such key"),
        serde_json::json!({}),
    );
    let (report, _) = run(body, &mut invoker).await;
    assert!(report.passed());
}

#[test]
fn test_duplicate_invoke_names_fail_at_load() {
    let body = "invoke login svc a.A B\ninvoke login svc a.A C\n";
    let err = plan(body).unwrap_err();
    match err {
        Error::DuplicateInvoke { name, pos, first } => {
            assert_eq!(name, "login");
            assert_eq!(pos.line, 4);
            assert_eq!(first.line, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_duplicate_endpoints_last_wins() {
    let body = "endpoint svc tls \"remote\" port 443\ninvoke login svc a.A B\n";
    let plan = plan(body).unwrap();
    let endpoint = plan.endpoint("svc").unwrap();
    assert_eq!(endpoint.host, "remote");
    assert!(endpoint.tls);
}

#[test]
fn test_forward_reference_fails_before_any_call() {
    let body = "invoke a svc x.X A\n    data { v: b.response.v }\ninvoke b svc x.X B\n";
    let err = plan(body).unwrap_err();
    assert!(
        matches!(&err, Error::Resolve { source: ResolveError::NotReady { .. }, .. }),
        "{err:?}"
    );
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_undeclared_reference_is_not_found() {
    let body = "invoke a svc x.X A\n    data { v: ghost.response.v }\n";
    let err = plan(body).unwrap_err();
    assert!(
        matches!(&err, Error::Resolve { source: ResolveError::UnknownInvoke { .. }, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_expectation_argument_references_checked_at_load() {
    let ghost = "invoke a svc x.X A\n    expects { response.v isEqual(ghost.response.v) }\n";
    let err = plan(ghost).unwrap_err();
    assert!(
        matches!(&err, Error::Resolve { source: ResolveError::UnknownInvoke { .. }, .. }),
        "{err:?}"
    );
    assert_eq!(err.exit_code(), 2);

    let later = "invoke a svc x.X A\n    expects { message isEqual(b.response.v) }\ninvoke b svc x.X B\n";
    let err = plan(later).unwrap_err();
    assert!(
        matches!(&err, Error::Resolve { source: ResolveError::NotReady { .. }, .. }),
        "{err:?}"
    );

    let earlier_and_own = "invoke a svc x.X A\ninvoke b svc x.X B\n    expects { response.v isEqual(a.response.v) response.w isEqual(b.data.w) }\n";
    assert!(plan(earlier_and_own).is_ok());
}

#[test_case::test_case("maxtime 1e400" ; "infinite maxtime")]
#[test_case::test_case("maxtime -1" ; "negative maxtime")]
#[test_case::test_case("timeout -0.5" ; "negative timeout")]
#[test_case::test_case("timeout 1e300" ; "overflowing timeout")]
fn test_out_of_range_metadata_timeouts_rejected(option: &str) {
    let source = format!("test \"t\" desc \"d\" trpc \"v0.0.1\" {option}\n");
    let spec = syntax::parse("t.trpc", &source).unwrap();
    let err = TestPlan::load(&spec).unwrap_err();
    assert_eq!(err.exit_code(), 2, "{err}");
    assert!(err.to_string().contains("non-negative number of seconds"), "{err}");
}

#[tokio::test]
async fn test_large_maxtime_runs_without_deadline_overflow() {
    let source = "test \"t\" desc \"d\" trpc \"v0.0.1\" maxtime 1e15\n\
                  endpoint svc \"localhost\" port 50051\n\
                  invoke ping svc health.Health Check\n";
    let spec = syntax::parse("t.trpc", source).unwrap();
    let mut plan = TestPlan::load(&spec).unwrap();
    let report = plan
        .execute(&mut ScriptedInvoker::default(), &mut Recorder::default())
        .await
        .unwrap();
    assert!(report.passed());
}

#[test]
fn test_metadata_must_come_first_and_be_named() {
    let spec = syntax::parse("t.trpc", "endpoint svc \"h\" port 1\n").unwrap();
    let err = TestPlan::load(&spec).unwrap_err();
    assert_eq!(err.to_string(), "Be kind and name your test");

    let spec = syntax::parse("t.trpc", "test \"\" desc \"\" trpc \"v0.0.1\"\n").unwrap();
    assert!(TestPlan::load(&spec).is_err());
}

#[tokio::test]
async fn test_unknown_endpoint_lists_known_names() {
    let mut plan = plan("endpoint edge \"h\" port 1\ninvoke a auth x.X A\n").unwrap();
    let mut invoker = ScriptedInvoker::default();
    let err = plan.execute(&mut invoker, &mut Recorder::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "Endpoint \"auth\" not found for Invoke \"a\"\nKnown endpoints:\nedge\nsvc");
    assert!(invoker.calls.is_empty());
}

#[test]
fn test_schema_imports_are_collected() {
    let plan = plan("importpath \"protos\"\nimport protofile \"auth.proto\"\nimport protoset \"all.pb\"\n").unwrap();
    assert_eq!(plan.imports.import_paths, vec!["protos"]);
    assert_eq!(plan.imports.proto_files, vec!["auth.proto"]);
    assert_eq!(plan.imports.proto_sets, vec!["all.pb"]);
}

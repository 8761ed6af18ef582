//! Exit codes of the file run loop

use std::path::{Path, PathBuf};

use test_case::test_case;

use trpc_cli::config::{RunnerConfig, TlsConfig};
use trpc_cli::run::{collect_specs, run_all, run_file};

const HEADER: &str = "test \"cli\" desc \"exit codes\" trpc \"v0.0.1\"\n";

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, body).unwrap();
    path
}

fn quick_config() -> RunnerConfig {
    RunnerConfig { connect_timeout: 1.0, ..Default::default() }
}

#[test]
fn test_collect_specs_walks_directories_sorted() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "b.trpc", HEADER);
    write(dir.path(), "nested/a.trpc", HEADER);
    write(dir.path(), "notes.txt", "");
    let single = write(dir.path(), "single.spec", HEADER);

    let found = collect_specs(&[dir.path().to_path_buf(), single.clone()]).unwrap();
    let names: Vec<String> = found
        .iter()
        .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
        .collect();
    assert_eq!(names, vec!["b.trpc", "nested/a.trpc", "single.spec"]);
}

#[test]
fn test_collect_specs_missing_path() {
    let err = collect_specs(&[PathBuf::from("/nonexistent/specs")]).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_spec_without_invokes_passes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "empty.trpc", &format!("{HEADER}endpoint svc \"localhost\" port 50051\n"));
    assert_eq!(run_file(&path, &quick_config()).await, 0);
}

#[test_case("endpoint svc \"localhost\" port 50051\n" ; "missing metadata")]
#[test_case("test \"cli\" desc \"x\" trpc \"v0.0.1\"\nendpoint svc port\n" ; "malformed endpoint")]
#[test_case("test \"cli\" desc \"x\" trpc \"v0.0.1\"\ninvoke a nowhere pkg.Svc Call\n" ; "unknown endpoint")]
#[test_case("test \"cli\" desc \"x\" trpc \"v0.0.1\"\nendpoint svc \"localhost\" port 50051\ninvoke a svc pkg.Svc Call\n    data { id: b.response.id }\n" ; "forward reference")]
#[tokio::test]
async fn test_specification_errors_exit_2(source: &str) {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "bad.trpc", source);
    assert_eq!(run_file(&path, &quick_config()).await, 2);
}

#[tokio::test]
async fn test_unreachable_server_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "down.trpc",
        &format!("{HEADER}endpoint svc \"127.0.0.1\" port 1\ninvoke ping svc health.Health Check\n"),
    );
    assert_eq!(run_file(&path, &quick_config()).await, 1);
}

#[tokio::test]
async fn test_client_cert_on_plaintext_endpoint_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "plain.trpc",
        &format!("{HEADER}endpoint svc \"127.0.0.1\" port 1\ninvoke ping svc health.Health Check\n"),
    );
    let config = RunnerConfig {
        tls: TlsConfig { cert: Some("c.pem".into()), key: Some("k.pem".into()), ..Default::default() },
        ..quick_config()
    };
    assert_eq!(run_file(&path, &config).await, 2);
}

#[tokio::test]
async fn test_run_all_stops_at_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let good = write(dir.path(), "a.trpc", HEADER);
    let bad = write(dir.path(), "b.trpc", "endpoint svc \"localhost\" port 1\n");
    let missing = dir.path().join("c.trpc");

    assert_eq!(run_all(&[good.clone(), bad, missing.clone()], &quick_config()).await, 2);
    assert_eq!(run_all(&[good.clone()], &quick_config()).await, 0);
    assert_eq!(run_all(&[good, missing], &quick_config()).await, 1);
}

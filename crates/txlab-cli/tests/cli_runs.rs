use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("txlab-cli-test-{}-{}.{}", name, Ulid::new(), ext))
}

fn txlab(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_txlab"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to launch txlab: {err}"))
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "txlab failed:\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn field<'a>(stdout: &'a str, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}=");
    stdout
        .split_whitespace()
        .find_map(|token| token.strip_prefix(prefix.as_str()))
}

fn json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| {
            serde_json::from_str(line).unwrap_or_else(|err| panic!("bad JSON line {line}: {err}"))
        })
        .collect()
}

fn anomaly_types(stdout: &str) -> Vec<String> {
    json_lines(stdout)
        .iter()
        .filter_map(|value| value.get("type").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn path_arg(path: &Path) -> &str {
    path.to_str()
        .unwrap_or_else(|| panic!("non-utf8 temp path {}", path.display()))
}

#[test]
fn run_persists_trace_that_can_be_inspected_and_redetected() {
    let db = temp_path("persist", "sqlite");
    let stdout = stdout_of(&txlab(&[
        "run",
        "lost_update",
        "--operand-a",
        "50",
        "--operand-b=-20",
        "--trace-db",
        path_arg(&db),
    ]));
    assert_eq!(field(&stdout, "scenario"), Some("lost_update"));
    assert_eq!(field(&stdout, "isolation"), Some("read_committed"));
    assert_eq!(anomaly_types(&stdout), vec!["lost_update".to_string()]);
    let run_id = field(&stdout, "run_id").unwrap_or_else(|| panic!("no run_id in {stdout}"));
    let events: usize = field(&stdout, "events")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| panic!("no events count in {stdout}"));

    let verify = stdout_of(&txlab(&[
        "trace",
        "verify",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
    ]));
    assert_eq!(field(&verify, "chain_valid"), Some("true"));

    let listed = stdout_of(&txlab(&[
        "trace",
        "events",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
    ]));
    let listed = json_lines(&listed);
    assert_eq!(listed.len(), events);
    let sequences: Vec<u64> = listed
        .iter()
        .filter_map(|event| event.get("sequence_order").and_then(Value::as_u64))
        .collect();
    assert_eq!(sequences, (1..=events as u64).collect::<Vec<_>>());

    let stored = stdout_of(&txlab(&[
        "trace",
        "anomalies",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
    ]));
    assert_eq!(anomaly_types(&stored), vec!["lost_update".to_string()]);

    let runs = stdout_of(&txlab(&["trace", "runs", "--trace-db", path_arg(&db)]));
    let runs = json_lines(&runs);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].get("run_id").and_then(Value::as_str), Some(run_id));
    assert!(runs[0].get("ended_at").is_some_and(|value| !value.is_null()));

    let redetected = stdout_of(&txlab(&[
        "detect",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
    ]));
    assert_eq!(field(&redetected, "anomalies"), Some("1"));

    let exported = temp_path("export", "jsonl");
    let export = stdout_of(&txlab(&[
        "export",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
        "--out",
        path_arg(&exported),
    ]));
    assert!(export.starts_with(&format!("exported {events} events")));
    let body = fs::read_to_string(&exported).unwrap_or_else(|err| panic!("{err}"));
    assert_eq!(body.lines().count(), events);

    let from_file = stdout_of(&txlab(&["detect", "--events", path_arg(&exported)]));
    assert_eq!(anomaly_types(&from_file), vec!["lost_update".to_string()]);
}

#[test]
fn unknown_scenario_fails_before_touching_the_trace_db() {
    let db = temp_path("unknown", "sqlite");
    let output = txlab(&["run", "dirty_write", "--trace-db", path_arg(&db)]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("dirty_write"));
    assert!(!db.exists());
}

#[test]
fn stronger_isolation_flag_removes_dirty_read() {
    let stdout = stdout_of(&txlab(&["run", "dirty-read", "--isolation", "read_committed"]));
    assert_eq!(field(&stdout, "isolation"), Some("read_committed"));
    assert_eq!(field(&stdout, "anomalies"), Some("0"));
    let observed = json_lines(&stdout);
    assert_eq!(
        observed[0].get("t2_read_value").and_then(Value::as_i64),
        Some(100)
    );
}

#[test]
fn deadlock_run_reports_one_victim() {
    let stdout = stdout_of(&txlab(&["run", "deadlock"]));
    assert_eq!(stdout.matches("failure=deadlock").count(), 1);
    assert_eq!(stdout.matches("status=committed").count(), 1);
    assert_eq!(anomaly_types(&stdout), vec!["deadlock".to_string()]);
}

#[test]
fn write_skew_policy_controls_detection() {
    let db = temp_path("skew", "sqlite");
    let stdout = stdout_of(&txlab(&[
        "run",
        "write_skew",
        "--operand-a",
        "90",
        "--operand-b",
        "190",
        "--trace-db",
        path_arg(&db),
    ]));
    assert_eq!(anomaly_types(&stdout), vec!["write_skew".to_string()]);
    let run_id = field(&stdout, "run_id").unwrap_or_else(|| panic!("no run_id in {stdout}"));

    let strict = stdout_of(&txlab(&[
        "detect",
        "--trace-db",
        path_arg(&db),
        "--run-id",
        run_id,
        "--write-skew-min-total",
        "100",
    ]));
    assert_eq!(field(&strict, "anomalies"), Some("0"));
}

#[test]
fn config_file_supplies_pacing_and_overrides() {
    let config = temp_path("config", "yaml");
    fs::write(
        &config,
        "pacing: rendezvous\nisolation_overrides:\n  non_repeatable_read: REPEATABLE READ\n",
    )
    .unwrap_or_else(|err| panic!("{err}"));
    let stdout = stdout_of(&txlab(&[
        "run",
        "non_repeatable_read",
        "--config",
        path_arg(&config),
    ]));
    assert_eq!(field(&stdout, "isolation"), Some("repeatable_read"));
    assert_eq!(field(&stdout, "pacing"), Some("rendezvous"));
    assert_eq!(field(&stdout, "anomalies"), Some("0"));

    let bad = temp_path("bad-config", "yaml");
    fs::write(&bad, "pacing: sometimes\n").unwrap_or_else(|err| panic!("{err}"));
    assert!(!txlab(&["run", "lost_update", "--config", path_arg(&bad)])
        .status
        .success());
}

#[test]
fn isolation_matrix_lists_levels_anomalies_and_scenarios() {
    let stdout = stdout_of(&txlab(&["isolation"]));
    let lines = json_lines(&stdout);
    assert_eq!(lines.len(), 4 + 6 + 6);

    let write_skew = lines
        .iter()
        .find(|line| line.get("anomaly").and_then(Value::as_str) == Some("write_skew"))
        .unwrap_or_else(|| panic!("no write_skew row"));
    assert_eq!(
        write_skew.get("recommended").and_then(Value::as_str),
        Some("SERIALIZABLE")
    );

    let dirty = lines
        .iter()
        .find(|line| line.get("scenario").and_then(Value::as_str) == Some("dirty_read"))
        .unwrap_or_else(|| panic!("no dirty_read row"));
    assert_eq!(
        dirty.get("default_isolation").and_then(Value::as_str),
        Some("READ UNCOMMITTED")
    );
}

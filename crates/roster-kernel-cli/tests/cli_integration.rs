use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rk"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rk binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rk(args);
    if !output.status.success() {
        panic!(
            "rk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    parse_stdout(&output)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn statuses(report: &Value) -> Vec<String> {
    report["steps"]
        .as_array()
        .unwrap_or_else(|| panic!("report has no steps: {report}"))
        .iter()
        .map(|step| step["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn db_migrate_and_status_report_versions() {
    let dir = unique_temp_dir("rk-db");
    let db = dir.join("roster.db");

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(migrated["after_version"], 1);
    assert_eq!(migrated["contract_version"], "rk.v1");

    let status = run_json(["--db", path_str(&db), "db", "status"]);
    assert_eq!(status["up_to_date"], true);

    let check = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(check["quick_check_ok"], true);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn audit_commands_describe_dependencies() {
    let dir = unique_temp_dir("rk-audit");
    let db = dir.join("roster.db");

    let fks = run_json([
        "--db",
        path_str(&db),
        "audit",
        "foreign-keys",
        "--table",
        "classes",
        "--column",
        "id",
    ]);
    let names: Vec<&str> = fks["foreign_keys"]
        .as_array()
        .unwrap_or_else(|| panic!("missing foreign_keys: {fks}"))
        .iter()
        .filter_map(|fk| fk["constraint_name"].as_str())
        .collect();
    assert_eq!(names, vec!["fk_students_class_id"]);

    let unused = run_json([
        "--db",
        path_str(&db),
        "audit",
        "unused-column",
        "--table",
        "users",
        "--column",
        "email",
        "--hint",
        "SELECT email FROM users WHERE id = ?1",
    ]);
    assert_eq!(unused["unused"], false);

    let scan = run_json(["--db", path_str(&db), "audit", "scan"]);
    assert_eq!(scan["orphan_count"], 0);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn migration_run_is_gated_and_idempotent() {
    let dir = unique_temp_dir("rk-migration");
    let db = dir.join("roster.db");

    let blocked = dir.join("drop_class_id.yaml");
    write_file(
        &blocked,
        "name: drop_class_id\nsteps:\n  - kind: drop_column\n    table: students\n    column: class_id\n",
    );
    let plan = run_json(["--db", path_str(&db), "migration", "plan", "--file", path_str(&blocked)]);
    assert_eq!(plan["steps"][0]["plan"]["state"], "blocked");

    let output = run_rk(["--db", path_str(&db), "migration", "run", "--file", path_str(&blocked)]);
    assert!(!output.status.success());
    let report = parse_stdout(&output);
    assert_eq!(statuses(&report), vec!["failed"]);
    assert_eq!(report["steps"][0]["error"]["kind"], "precondition_failed");
    assert!(String::from_utf8_lossy(&output.stderr).contains("fk_students_class_id"));

    let additive = dir.join("nickname.json");
    write_file(
        &additive,
        r#"{"name": "nickname", "steps": [
            {"kind": "add_column", "table": "students", "column": {"name": "nickname", "sql_type": "TEXT"}}
        ]}"#,
    );
    let first = run_json(["--db", path_str(&db), "migration", "run", "--file", path_str(&additive)]);
    assert_eq!(statuses(&first), vec!["applied"]);
    let second = run_json(["--db", path_str(&db), "migration", "run", "--file", path_str(&additive)]);
    assert_eq!(statuses(&second), vec!["skipped"]);

    let unlock = run_json(["--db", path_str(&db), "migration", "unlock"]);
    assert_eq!(unlock["released"], false);

    let _ = fs::remove_dir_all(&dir);
}

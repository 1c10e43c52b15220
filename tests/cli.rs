mod common;

use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value as JsonValue;

use common::{ATTRIBUTION, TestWorkspace};

fn bulk_import() -> Command {
    Command::cargo_bin("bulk-import").expect("binary exists")
}

fn import_json(output: &[u8]) -> JsonValue {
    serde_json::from_slice(output).expect("import prints a JSON result")
}

#[test]
fn import_then_inspect_tables_and_schema() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("products.csv", "name,price\nWidget,9.99\nGadget,12.5\n");
    let db = workspace.db();

    let output = bulk_import()
        .args(["import", "-i", input.to_str().unwrap(), "-t", "products", "-a", ATTRIBUTION])
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = import_json(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["inserted"], 2);
    assert_eq!(result["schema"]["state"], "created");
    assert_eq!(result["performance"]["optimization_path"], "bulk");

    bulk_import()
        .arg("tables")
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(contains("products\t2"));

    bulk_import()
        .args(["schema", "-t", "products"])
        .arg("--db")
        .arg(&db)
        .assert()
        .success()
        .stdout(contains("id\tTEXT"))
        .stdout(contains("auth_email\tVARCHAR(255)"))
        .stdout(contains("price\tNUMERIC"));
}

#[test]
fn import_reads_stdin_when_format_is_given() {
    let workspace = TestWorkspace::new();
    let output = bulk_import()
        .args(["import", "-i", "-", "-t", "items", "-a", ATTRIBUTION, "--format", "json"])
        .arg("--db")
        .arg(workspace.db())
        .write_stdin(r#"[{"name":"a","quantity":1},{"name":"b","quantity":2}]"#)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = import_json(&output);
    assert_eq!(result["source_format"], "json");
    assert_eq!(result["inserted"], 2);
}

#[test]
fn stdin_without_format_is_rejected() {
    let workspace = TestWorkspace::new();
    bulk_import()
        .args(["import", "-i", "-", "-t", "items", "-a", ATTRIBUTION])
        .arg("--db")
        .arg(workspace.db())
        .write_stdin("name\na\n")
        .assert()
        .failure()
        .stderr(contains("--format is required"));
}

#[test]
fn unsupported_extension_prints_error_result_and_fails() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("notes.pdf", "%PDF-1.7");
    let output = bulk_import()
        .args(["import", "-i", input.to_str().unwrap(), "-t", "notes", "-a", ATTRIBUTION])
        .arg("--db")
        .arg(workspace.db())
        .assert()
        .failure()
        .stderr(contains("Unsupported file type: .pdf"))
        .get_output()
        .stdout
        .clone();
    let result = import_json(&output);
    assert_eq!(result["status"], "error");
    assert_eq!(result["processed_rows"], 0);
}

#[test]
fn custom_delimiter_and_batch_size_are_honoured() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("orders.txt", "sku;quantity\nA;1\nB;2\nC;3\n");
    let output = bulk_import()
        .args(["import", "-i", input.to_str().unwrap(), "-t", "orders", "-a", ATTRIBUTION])
        .args(["--delimiter", ";", "--batch-size", "1"])
        .arg("--db")
        .arg(workspace.db())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = import_json(&output);
    assert_eq!(result["inserted"], 3);
    assert_eq!(result["schema"]["added_columns"][1], "quantity");
}

#[test]
fn written_config_round_trips_into_import() {
    let workspace = TestWorkspace::new();
    let config = workspace.path().join("import.yaml");
    bulk_import()
        .args(["config", "-o", config.to_str().unwrap()])
        .assert()
        .success();
    let yaml = fs::read_to_string(&config).expect("config written");
    assert!(yaml.contains("batch_size: 500"));
    assert!(yaml.contains("critical_fields"));

    let input = workspace.write("scripts.csv", "name,query\nnightly,SELECT 1; DROP TABLE users\n");
    let output = bulk_import()
        .args(["import", "-i", input.to_str().unwrap(), "-t", "scripts", "-a", ATTRIBUTION])
        .args(["-c", config.to_str().unwrap()])
        .arg("--db")
        .arg(workspace.db())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let result = import_json(&output);
    assert_eq!(result["inserted"], 1);
    let warnings = result["warnings"].as_array().unwrap();
    assert!(
        warnings
            .iter()
            .any(|w| w.as_str().unwrap().contains("'query' rejected by sanitizer"))
    );
}

#[test]
fn schema_of_missing_table_fails() {
    let workspace = TestWorkspace::new();
    bulk_import()
        .args(["schema", "-t", "ghost"])
        .arg("--db")
        .arg(workspace.db())
        .assert()
        .failure()
        .stderr(contains("Table 'ghost' does not exist"));
}

mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, spawn_sidecar, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("resultsd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["version"].is_string());
    assert!(health["workspacePath"].is_null());

    let no_ws = request(&mut stdin, &mut reader, "2", "scales.list", json!({}));
    assert_eq!(error_code(&no_ws), Some("no_workspace"));

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("results.sqlite3").exists());

    let scope = json!({ "department": "Arts", "academicYear": "2024/2025", "term": "second" });
    let rank_scope = json!({ "className": "SS2B", "term": "second", "academicYear": "2024/2025" });

    let _ = request(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    let _ = request(&mut stdin, &mut reader, "5", "scales.list", json!({}));
    let _ = request(&mut stdin, &mut reader, "6", "scales.get", scope.clone());
    let _ = request(&mut stdin, &mut reader, "7", "assessmentConfigs.get", {
        let mut p = scope.clone();
        p["assessmentType"] = json!("raw");
        p
    });
    let _ = request(&mut stdin, &mut reader, "8", "results.list", rank_scope.clone());
    let _ = request(&mut stdin, &mut reader, "9", "results.subjectRanking", rank_scope.clone());
    let _ = request(&mut stdin, &mut reader, "10", "results.recompute", rank_scope.clone());
    let _ = request(&mut stdin, &mut reader, "11", "results.export", rank_scope);
    let _ = request(&mut stdin, &mut reader, "12", "mock.rank", json!({ "session": "none" }));
    let _ = request(&mut stdin, &mut reader, "13", "import.template", json!({ "target": "roster" }));
    let _ = request(&mut stdin, &mut reader, "14", "import.issues", json!({ "batchId": "none" }));
    let _ = request(&mut stdin, &mut reader, "15", "import.cancel", json!({ "batchId": "none" }));

    let unknown = request_raw(&mut stdin, &mut reader, "16", "grades.teleport");
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bad_params_and_bad_json_are_reported() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let missing = request(&mut stdin, &mut reader, "1", "workspace.select", json!({}));
    assert_eq!(error_code(&missing), Some("bad_params"));

    {
        use std::io::{BufRead, Write};
        writeln!(stdin, "{{not json").expect("write");
        stdin.flush().expect("flush");
        let mut line = String::new();
        reader.read_line(&mut line).expect("read");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
        assert_eq!(error_code(&value), Some("bad_json"));
    }

    // The daemon keeps serving after a malformed line.
    let _ = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn setup_sections_merge_and_validate() {
    let workspace = temp_dir("resultsd-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(defaults["grading"]["outOfRangePolicy"], "reject");
    assert_eq!(defaults["import"]["maxReportedIssues"], 200);
    assert_eq!(defaults["mock"]["optionalCount"], 2);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "grading", "patch": { "outOfRangePolicy": "clamp" } }),
    );
    assert_eq!(updated["value"]["outOfRangePolicy"], "clamp");

    let typo = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "import", "patch": { "maxIssues": 5 } }),
    );
    assert_eq!(error_code(&typo), Some("bad_params"));

    let out_of_bounds = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "mock", "patch": { "optionalCount": 99 } }),
    );
    assert_eq!(error_code(&out_of_bounds), Some("bad_params"));

    // Settings live in the workspace database and survive a restart.
    drop(stdin);
    let _ = child.wait();
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reloaded = request_ok(&mut stdin, &mut reader, "7", "setup.get", json!({}));
    assert_eq!(reloaded["grading"]["outOfRangePolicy"], "clamp");
    assert_eq!(reloaded["import"]["maxReportedIssues"], 200);

    drop(stdin);
    let _ = child.wait();
}

fn request_raw(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    method: &str,
) -> serde_json::Value {
    test_support::send(stdin, id, method, json!({}));
    test_support::read_response(reader, id).0
}

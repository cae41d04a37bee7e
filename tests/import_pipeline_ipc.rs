mod test_support;

use serde_json::json;
use std::io::{BufRead, BufReader};
use std::process::ChildStdout;
use test_support::{error_code, request, request_ok, request_with_events, science_workspace, send};

const THREE_ROWS: &str = "student_no,last_name,first_name,subject,score\n\
    S001,Okafor,Ada,Mathematics,92\n\
    S002,Bello,Tunde,Mathematics,150\n\
    S003,Mensah,Kofi,Mathematics,74\n";

fn science_defaults() -> serde_json::Value {
    json!({
        "className": "JSS1A",
        "term": "first",
        "academicYear": "2024/2025",
        "department": "Science"
    })
}

fn progress_events(events: &[serde_json::Value]) -> Vec<&serde_json::Value> {
    events
        .iter()
        .filter(|e| e["event"] == "import.progress")
        .collect()
}

#[test]
fn score_import_streams_progress_and_reports_bad_rows() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-progress");

    let (resp, events) = request_with_events(
        &mut stdin,
        &mut reader,
        "1",
        "import.run",
        json!({
            "batchId": "batch-1",
            "target": "scores",
            "format": "csv",
            "payload": THREE_ROWS,
            "defaults": science_defaults()
        }),
    );
    assert_eq!(resp["ok"], true, "{}", resp);
    let summary = &resp["result"];
    assert_eq!(summary["batchId"], "batch-1");
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["imported"], 2);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["phase"], "complete");
    assert_eq!(summary["issues"][0]["line"], 3);
    assert_eq!(summary["issues"][0]["code"], "score_out_of_range");

    let progress = progress_events(&events);
    assert_eq!(progress.len(), 3);
    for (i, e) in progress.iter().enumerate() {
        assert_eq!(e["requestId"], "1");
        assert_eq!(e["batchId"], "batch-1");
        assert_eq!(e["progress"]["current"], i + 1);
        assert_eq!(e["progress"]["total"], 3);
    }
    assert_eq!(progress[2]["progress"]["phase"], "complete");

    let issues = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.issues",
        json!({ "batchId": "batch-1" }),
    );
    assert_eq!(issues["total"], 1);

    let ranking = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.subjectRanking",
        json!({
            "className": "JSS1A",
            "term": "first",
            "academicYear": "2024/2025",
            "subject": "Mathematics"
        }),
    );
    let rows = ranking["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["studentNo"], "S001");
    assert_eq!(rows[0]["grade"], "A");
    assert_eq!(rows[1]["studentNo"], "S003");
    assert_eq!(rows[1]["grade"], "F");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn rerunning_the_same_payload_only_updates() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-rerun");
    let params = json!({
        "target": "scores",
        "payload": THREE_ROWS,
        "defaults": science_defaults()
    });

    let first = request_ok(&mut stdin, &mut reader, "1", "import.run", params.clone());
    assert_eq!(first["created"], 2);
    assert_eq!(first["updated"], 0);
    let second = request_ok(&mut stdin, &mut reader, "2", "import.run", params);
    assert_eq!(second["created"], 0);
    assert_eq!(second["updated"], 2);
    assert_eq!(first["payloadSha256"], second["payloadSha256"]);
    assert_ne!(first["batchId"], second["batchId"]);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.list",
        json!({ "className": "JSS1A", "term": "first", "academicYear": "2024/2025" }),
    );
    assert_eq!(listed["results"].as_array().map(|r| r.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn json_payloads_and_templates() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-json");

    let template = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.template",
        json!({ "target": "scores" }),
    );
    let headers = template["headers"].as_array().expect("headers");
    assert_eq!(headers.first(), Some(&json!("student_no")));
    assert_eq!(headers.last(), Some(&json!("score")));

    let payload = json!([
        { "Student No": "S010", "Last Name": "Adeyemi", "First Name": "Bola", "Subject": "Biology", "Score": 81 },
        { "Student No": "S011", "Last Name": "Eze", "First Name": "Chi", "Subject": "Biology", "Score": "abc" }
    ]);
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({
            "target": "scores",
            "format": "json",
            "payload": payload.to_string(),
            "defaults": science_defaults()
        }),
    );
    assert_eq!(summary["imported"], 1);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["issues"][0]["line"], 2);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unreadable_payload_fails_with_summary() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-parse");

    let (resp, events) = request_with_events(
        &mut stdin,
        &mut reader,
        "1",
        "import.run",
        json!({ "target": "scores", "format": "json", "payload": "[1,2]" }),
    );
    assert_eq!(error_code(&resp), Some("parse_failed"));
    assert_eq!(resp["error"]["details"]["summary"]["phase"], "failed");
    let progress = progress_events(&events);
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0]["progress"]["phase"], "failed");

    let bad_target = request(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({ "target": "grades", "payload": "" }),
    );
    assert_eq!(error_code(&bad_target), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn cancel_reaches_a_queued_batch() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-cancel");

    let unknown = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.cancel",
        json!({ "batchId": "nope" }),
    );
    assert_eq!(unknown["cancelled"], false);

    let mut payload = String::from("student_no,last_name,first_name,subject,score\n");
    for i in 0..500 {
        payload.push_str(&format!("S{:04},Last,First,Chemistry,{}\n", i, i % 100));
    }

    // The cancel is answered by the reader thread, so it can arrive before
    // the batch response. The batch was registered on receipt, so the cancel
    // always finds it.
    send(
        &mut stdin,
        "2",
        "import.run",
        json!({
            "batchId": "big",
            "target": "scores",
            "payload": payload,
            "defaults": science_defaults()
        }),
    );
    send(&mut stdin, "3", "import.cancel", json!({ "batchId": "big" }));

    let mut cancel_resp = None;
    let mut run_resp = None;
    for _ in 0..2 {
        let value = next_response(&mut reader);
        match value["id"].as_str() {
            Some("2") => run_resp = Some(value),
            Some("3") => cancel_resp = Some(value),
            other => panic!("unexpected response id {:?}", other),
        }
    }
    let cancel_resp = cancel_resp.expect("cancel response");
    let run_resp = run_resp.expect("run response");
    assert_eq!(cancel_resp["result"]["cancelled"], true);
    let summary = &run_resp["result"];
    assert_eq!(summary["cancelled"], true);
    assert_eq!(summary["phase"], "complete");
    let imported = summary["imported"].as_u64().expect("imported");
    let not_processed = summary["notProcessed"].as_u64().expect("notProcessed");
    assert_eq!(imported + summary["failed"].as_u64().unwrap_or(0) + not_processed, 500);
    assert!(not_processed > 0);

    drop(stdin);
    let _ = child.wait();
}

/// Next non-event line, whichever request it answers.
fn next_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).expect("read line");
        assert!(n > 0, "sidecar closed stdout");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse json");
        if value.get("event").is_none() {
            return value;
        }
    }
}

#[test]
fn roster_then_mock_import() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-import-roster");

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.run",
        json!({
            "target": "roster",
            "payload": "student_no,last_name,first_name,class_name\nS100,Akande,Femi,SS3A\nS101,Obi,Ngozi,SS3A\n"
        }),
    );
    assert_eq!(roster["imported"], 2);
    assert_eq!(roster["created"], 2);

    // Names come from the roster, so mock rows may leave them blank.
    let mock = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.run",
        json!({
            "target": "mock",
            "payload": "student_no,subject,percentage\nS100,English Language,81\nS101,English Language,64\n",
            "defaults": { "session": "2025-mock-1" }
        }),
    );
    assert_eq!(mock["imported"], 2, "{}", mock);

    drop(stdin);
    let _ = child.wait();
}

mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, science_workspace};

fn science(extra: serde_json::Value) -> serde_json::Value {
    let mut params = json!({
        "department": "Science",
        "academicYear": "2024/2025",
        "term": "first",
    });
    if let (Some(obj), Some(more)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    params
}

#[test]
fn resolves_grades_against_the_saved_scale() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-scales-resolve");

    let a = request_ok(&mut stdin, &mut reader, "1", "scales.resolve", science(json!({ "score": 92 })));
    assert_eq!(a["grade"], "A");
    assert_eq!(a["remark"], "Excellent");

    let f = request_ok(&mut stdin, &mut reader, "2", "scales.resolve", science(json!({ "score": 74 })));
    assert_eq!(f["grade"], "F");

    // The 74..75 seam belongs to the lower band.
    let seam = request_ok(&mut stdin, &mut reader, "3", "scales.resolve", science(json!({ "score": 74.5 })));
    assert_eq!(seam["grade"], "F");

    let out = request(&mut stdin, &mut reader, "4", "scales.resolve", science(json!({ "score": 150 })));
    assert_eq!(error_code(&out), Some("score_out_of_range"));
    assert_eq!(out["error"]["details"]["score"], 150.0);

    let clamped = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scales.resolve",
        science(json!({ "score": 150, "outOfRangePolicy": "clamp" })),
    );
    assert_eq!(clamped["grade"], "A");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn missing_and_invalid_scales_are_reported() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-scales-invalid");

    let missing = request(
        &mut stdin,
        &mut reader,
        "1",
        "scales.resolve",
        json!({ "department": "Arts", "academicYear": "2024/2025", "term": "first", "score": 50 }),
    );
    assert_eq!(error_code(&missing), Some("no_scale_configured"));

    let overlap = request(
        &mut stdin,
        &mut reader,
        "2",
        "scales.save",
        science(json!({
            "bands": [
                { "fromPercentage": 0, "toPercentage": 60, "grade": "F" },
                { "fromPercentage": 50, "toPercentage": 100, "grade": "P" }
            ]
        })),
    );
    assert_eq!(error_code(&overlap), Some("invalid_scale"));

    // The rejected save leaves the stored scale in place.
    let kept = request_ok(&mut stdin, &mut reader, "3", "scales.get", science(json!({})));
    assert_eq!(kept["scale"]["bands"].as_array().map(|b| b.len()), Some(3));

    let listed = request_ok(&mut stdin, &mut reader, "4", "scales.list", json!({}));
    let scopes = listed["scopes"].as_array().expect("scopes");
    assert_eq!(scopes.len(), 1);
    assert_eq!(scopes[0]["department"], "Science");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn saving_a_new_scale_takes_effect_immediately() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-scales-replace");

    let before = request_ok(&mut stdin, &mut reader, "1", "scales.resolve", science(json!({ "score": 80 })));
    assert_eq!(before["grade"], "B");

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scales.save",
        science(json!({
            "bands": [
                { "fromPercentage": 0, "toPercentage": 49, "grade": "F" },
                { "fromPercentage": 50, "toPercentage": 100, "grade": "P" }
            ]
        })),
    );
    let after = request_ok(&mut stdin, &mut reader, "3", "scales.resolve", science(json!({ "score": 80 })));
    assert_eq!(after["grade"], "P");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn weighted_assessment_configs_drive_subject_totals() {
    let (mut child, mut stdin, mut reader, _ws) = science_workspace("resultsd-scales-config");

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assessmentConfigs.save",
        science(json!({
            "assessmentType": "termly",
            "components": [
                { "name": "ca1", "max": 20 },
                { "name": "ca2", "max": 20 },
                { "name": "exam", "max": 60 }
            ]
        })),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assessmentConfigs.get",
        science(json!({ "assessmentType": "termly" })),
    );
    assert_eq!(got["config"]["total"], 100.0);
    assert_eq!(got["maxTotal"], 100.0);

    let computed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.compute",
        science(json!({
            "assessmentType": "termly",
            "components": { "ca1": 18, "ca2": 17, "exam": 57 }
        })),
    );
    assert_eq!(computed["score"]["total"], 92.0);
    assert_eq!(computed["score"]["grade"], "A");

    let over = request(
        &mut stdin,
        &mut reader,
        "4",
        "scores.compute",
        science(json!({
            "assessmentType": "termly",
            "components": { "ca1": 25, "ca2": 17, "exam": 57 }
        })),
    );
    assert_eq!(error_code(&over), Some("invalid_component_score"));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "5",
        "scores.compute",
        science(json!({ "assessmentType": "weekly", "components": { "score": 50 } })),
    );
    assert_eq!(error_code(&unknown), Some("no_assessment_config"));

    drop(stdin);
    let _ = child.wait();
}

use crate::engine::SubjectEntry;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_opt_str, get_required_str, get_string_list, grading_scope, out_of_range_policy,
    rank_scope, workspace, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{components_from_json, RAW_ASSESSMENT_TYPE};
use crate::store::StudentFields;
use crate::tabular;
use serde_json::{json, Value};

fn assessment_type(params: &Value) -> String {
    get_opt_str(params, "assessmentType").unwrap_or_else(|| RAW_ASSESSMENT_TYPE.to_string())
}

fn components(params: &Value) -> Result<crate::scoring::ComponentScores, HandlerErr> {
    let raw = params
        .get("components")
        .ok_or_else(|| HandlerErr::bad_params("missing components"))?;
    Ok(components_from_json(raw)?)
}

fn scores_compute(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let config = ws.engine.assessment_config(&scope, &assessment_type(params))?;
    let policy = out_of_range_policy(ws, params)?;
    let score = ws
        .engine
        .compute_subject_score(&components(params)?, &config, policy)?;
    Ok(json!({ "score": score }))
}

fn scores_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = rank_scope(params)?;
    let last_name = get_opt_str(params, "lastName");
    let first_name = get_opt_str(params, "firstName");
    let student = if last_name.is_some() || first_name.is_some() {
        Some(StudentFields {
            last_name: last_name.unwrap_or_default(),
            first_name: first_name.unwrap_or_default(),
            class_name: Some(scope.class_name.clone()),
        })
    } else {
        None
    };
    let entry = SubjectEntry {
        student_no: get_required_str(params, "studentNo")?,
        student,
        scope,
        department: get_required_str(params, "department")?,
        assessment_type: assessment_type(params),
        subject: get_required_str(params, "subject")?,
        components: components(params)?,
    };
    let policy = out_of_range_policy(ws, params)?;
    let entered = ws.engine.enter_subject_score(&entry, policy)?;
    tracing::debug!(
        student = %entry.student_no,
        subject = %entry.subject,
        created = entered.created,
        "subject score saved"
    );
    Ok(json!(entered))
}

fn results_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let ranking = ws.engine.ranking(&rank_scope(params)?)?;
    Ok(json!({
        "scope": ranking.scope,
        "results": ranking.results,
    }))
}

fn results_subject_ranking(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let ranking = ws.engine.ranking(&rank_scope(params)?)?;
    match get_opt_str(params, "subject") {
        Some(subject) => {
            let rows = ranking
                .subjects
                .get(&subject.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default();
            Ok(json!({ "subject": subject, "rows": rows }))
        }
        None => Ok(json!({ "subjects": ranking.subjects })),
    }
}

fn results_recompute(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = rank_scope(params)?;
    let policy = out_of_range_policy(ws, params)?;
    let summary = ws.engine.recompute_scope(&scope, policy)?;
    Ok(json!(summary))
}

fn results_approve(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let ids = get_string_list(params, "resultIds")?;
    let approved = params
        .get("approved")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("approved must be a boolean"))?;
    let updated = ws.engine.set_approved(&ids, approved)?;
    Ok(json!({ "updated": updated }))
}

fn results_delete(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let ids = get_string_list(params, "resultIds")?;
    let deleted = ws.engine.delete_results(&ids)?;
    Ok(json!({ "deleted": deleted.results, "scopes": deleted.scopes }))
}

fn results_export(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let format = get_opt_str(params, "format").unwrap_or_else(|| "csv".to_string());
    if !format.eq_ignore_ascii_case("csv") {
        return Err(HandlerErr::bad_params("format must be csv"));
    }
    let ranking = ws.engine.ranking(&rank_scope(params)?)?;
    let grid = tabular::results_grid(&ranking);
    let csv = grid.to_csv();
    Ok(json!({
        "format": "csv",
        "headerRows": grid.header_rows,
        "rows": grid.rows,
        "csv": csv,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "scores.compute" => scores_compute(state, &req.params),
        "scores.upsert" => scores_upsert(state, &req.params),
        "results.list" => results_list(state, &req.params),
        "results.subjectRanking" => results_subject_ranking(state, &req.params),
        "results.recompute" => results_recompute(state, &req.params),
        "results.approve" => results_approve(state, &req.params),
        "results.delete" => results_delete(state, &req.params),
        "results.export" => results_export(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

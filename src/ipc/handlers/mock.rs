use crate::ipc::error::ok;
use crate::ipc::helpers::{get_opt_str, get_required_f64, get_required_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::settings;
use crate::store::StudentFields;
use serde_json::{json, Value};

fn mock_upsert(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let student_no = get_required_str(params, "studentNo")?;
    let last_name = get_opt_str(params, "lastName");
    let first_name = get_opt_str(params, "firstName");
    let student = (last_name.is_some() || first_name.is_some()).then(|| StudentFields {
        last_name: last_name.unwrap_or_default(),
        first_name: first_name.unwrap_or_default(),
        class_name: get_opt_str(params, "className"),
    });
    let saved = ws.engine.upsert_mock_score(
        &student_no,
        student.as_ref(),
        &get_required_str(params, "session")?,
        &get_required_str(params, "subject")?,
        get_required_f64(params, "percentage")?,
    )?;
    Ok(json!({ "score": saved.record, "created": saved.created }))
}

fn mock_rank(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let session = get_required_str(params, "session")?;
    let scheme = settings::mock_scheme(&ws.store)?;
    let ranking = ws.engine.mock_ranking(&session, &scheme)?;
    Ok(json!({
        "session": session,
        "ranked": ranking.ranked,
        "excluded": ranking.excluded,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "mock.upsert" => mock_upsert(state, &req.params),
        "mock.rank" => mock_rank(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

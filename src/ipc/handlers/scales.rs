use crate::grading::GradeBand;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    get_required_f64, get_required_str, grading_scope, out_of_range_policy, workspace, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{AssessmentConfig, ComponentDef};
use serde_json::{json, Value};

fn scales_save(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let bands: Vec<GradeBand> = params
        .get("bands")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing bands"))
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| HandlerErr::bad_params(format!("bands: {}", e)))
        })?;
    let policy = out_of_range_policy(ws, params)?;
    let (scale, regraded) = ws.engine.save_scale(&scope, bands, policy)?;
    Ok(json!({ "scale": scale, "regraded": regraded }))
}

fn scales_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let scale = ws.engine.scale(&scope)?;
    Ok(json!({ "scale": scale.as_ref() }))
}

fn scales_list(state: &AppState) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scopes = ws.engine.store().grading_scopes()?;
    Ok(json!({ "scopes": scopes }))
}

fn scales_resolve(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let score = get_required_f64(params, "score")?;
    let policy = out_of_range_policy(ws, params)?;
    let resolved = ws.engine.resolver(policy).resolve_grade(score, &scope)?;
    Ok(json!({
        "score": score,
        "grade": resolved.grade,
        "remark": resolved.remark,
    }))
}

fn configs_save(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let assessment_type = get_required_str(params, "assessmentType")?;
    let components: Vec<ComponentDef> = params
        .get("components")
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("missing components"))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| HandlerErr::bad_params(format!("components: {}", e)))
        })?;
    let total = match params.get("total") {
        Some(_) => get_required_f64(params, "total")?,
        None => components.iter().map(|c| c.max).sum(),
    };
    let normalize_to = match params.get("normalizeTo") {
        None | Some(Value::Null) => None,
        Some(_) => Some(get_required_f64(params, "normalizeTo")?),
    };

    let config = AssessmentConfig {
        scope,
        assessment_type,
        components,
        total,
        normalize_to,
    };
    let policy = out_of_range_policy(ws, params)?;
    let regraded = ws.engine.save_assessment_config(&config, policy)?;
    Ok(json!({ "config": config, "regraded": regraded }))
}

fn configs_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let scope = grading_scope(params)?;
    let assessment_type = get_required_str(params, "assessmentType")?;
    let config = ws.engine.assessment_config(&scope, &assessment_type)?;
    Ok(json!({ "config": config, "maxTotal": config.max_total() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "scales.save" => scales_save(state, &req.params),
        "scales.get" => scales_get(state, &req.params),
        "scales.list" => scales_list(state),
        "scales.resolve" => scales_resolve(state, &req.params),
        "assessmentConfigs.save" => configs_save(state, &req.params),
        "assessmentConfigs.get" => configs_get(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

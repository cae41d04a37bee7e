use crate::error::EngineError;
use crate::grading::{GradingScope, OutOfRangePolicy};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Workspace};
use crate::ranking::RankScope;
use crate::settings;
use serde_json::Value;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

impl From<EngineError> for HandlerErr {
    fn from(e: EngineError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            details: e.details(),
        }
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: format!("{e:#}"),
            details: None,
        }
    }
}

pub fn workspace(state: &AppState) -> Result<&Workspace, HandlerErr> {
    state.workspace.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

pub fn get_string_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let arr = params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an array", key)))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params(format!("{} entries must be strings", key)))
        })
        .collect()
}

/// `{department, academicYear, term}`
pub fn grading_scope(params: &Value) -> Result<GradingScope, HandlerErr> {
    Ok(GradingScope::new(
        &get_required_str(params, "department")?,
        &get_required_str(params, "academicYear")?,
        &get_required_str(params, "term")?,
    ))
}

/// `{className, term, academicYear}`
pub fn rank_scope(params: &Value) -> Result<RankScope, HandlerErr> {
    Ok(RankScope::new(
        &get_required_str(params, "className")?,
        &get_required_str(params, "term")?,
        &get_required_str(params, "academicYear")?,
    ))
}

/// Policy from the request when given, otherwise from `setup.grading`.
pub fn out_of_range_policy(ws: &Workspace, params: &Value) -> Result<OutOfRangePolicy, HandlerErr> {
    match params.get("outOfRangePolicy").and_then(|v| v.as_str()) {
        Some(raw) => OutOfRangePolicy::parse(raw)
            .ok_or_else(|| HandlerErr::bad_params("outOfRangePolicy must be one of: reject, clamp")),
        None => Ok(settings::grading_settings(&ws.store)?.out_of_range_policy),
    }
}

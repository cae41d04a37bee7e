use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, SetupSection};
use serde_json::{json, Map, Value};

fn setup_get(state: &AppState) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        out.insert(
            section.name().to_string(),
            settings::load_section(&ws.store, section)?,
        );
    }
    Ok(Value::Object(out))
}

fn setup_update(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let ws = workspace(state)?;
    let section_raw = get_required_str(params, "section")?;
    let section = SetupSection::parse(&section_raw)
        .ok_or_else(|| HandlerErr::bad_params("unknown section"))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("patch must be an object"))?;

    let saved = settings::update_section(&ws.store, section, patch)?
        .map_err(HandlerErr::bad_params)?;
    tracing::info!(section = section.name(), "settings updated");
    Ok(json!({ "section": section.name(), "value": saved }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "setup.get" => setup_get(state),
        "setup.update" => setup_update(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

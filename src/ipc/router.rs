use super::handlers;
use super::types::{AppState, CancelRegistry, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _enter = span.enter();

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::scales::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::results::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::mock::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::imports::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

/// Runs on the reader thread before a request is queued for the worker.
/// Answers `import.cancel` immediately and registers the cancel token of an
/// `import.run` so a cancel sent right after it always finds the batch.
/// Returns the request to queue, or the response to send now.
pub fn handle_inline(
    cancels: &CancelRegistry,
    req: Request,
) -> Result<Request, serde_json::Value> {
    match req.method.as_str() {
        "import.cancel" => Err(handlers::imports::handle_cancel(cancels, &req)),
        "import.run" => Ok(handlers::imports::prepare_run(cancels, req)),
        _ => Ok(req),
    }
}

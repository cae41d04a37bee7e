use crate::grading::GradingScope;
use crate::import::{
    run_import, template_headers, BatchDefaults, BatchPhase, ImportRequest, ImportTarget, Progress,
    ProgressSink,
};
use crate::ipc::error::{err, event, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, out_of_range_policy, workspace, HandlerErr};
use crate::ipc::types::{AppState, CancelRegistry, FinishedBatch, Outbox, Request};
use crate::settings;
use crate::tabular::{csv_quote, PayloadFormat};
use serde_json::{json, Value};

/// Streams batch progress as `import.progress` / `import.phase` events
/// tagged with the originating request id.
struct IpcProgress<'a> {
    outbox: &'a Outbox,
    request_id: &'a str,
    batch_id: &'a str,
}

impl ProgressSink for IpcProgress<'_> {
    fn progress(&mut self, progress: &Progress) {
        self.outbox.send(&event(
            "import.progress",
            self.request_id,
            json!({ "batchId": self.batch_id, "progress": progress }),
        ));
    }

    fn phase(&mut self, phase: BatchPhase, message: &str) {
        self.outbox.send(&event(
            "import.phase",
            self.request_id,
            json!({ "batchId": self.batch_id, "phase": phase, "message": message }),
        ));
    }
}

/// Gives an `import.run` a batch id when the caller left it out and
/// registers its cancel token before the request is queued.
pub fn prepare_run(cancels: &CancelRegistry, mut req: Request) -> Request {
    if !req.params.is_object() {
        req.params = json!({});
    }
    let batch_id = match get_opt_str(&req.params, "batchId") {
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };
    req.params["batchId"] = Value::String(batch_id.clone());
    cancels.register(&batch_id);
    req
}

pub fn handle_cancel(cancels: &CancelRegistry, req: &Request) -> Value {
    let Some(batch_id) = get_opt_str(&req.params, "batchId") else {
        return err(&req.id, "bad_params", "missing batchId", None);
    };
    let cancelled = cancels.cancel(&batch_id);
    tracing::info!(batch = %batch_id, cancelled, "cancel requested");
    ok(&req.id, json!({ "batchId": batch_id, "cancelled": cancelled }))
}

fn import_run(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let params = &req.params;
    let batch_id = get_required_str(params, "batchId")?;
    let outcome = {
        let ws = workspace(state)?;
        let target_raw = get_required_str(params, "target")?;
        let target = ImportTarget::parse(&target_raw)
            .ok_or_else(|| HandlerErr::bad_params("target must be one of: roster, scores, mock"))?;
        let format_raw = get_opt_str(params, "format").unwrap_or_else(|| "csv".to_string());
        let format = PayloadFormat::parse(&format_raw)
            .ok_or_else(|| HandlerErr::bad_params("format must be one of: csv, json"))?;
        let payload = params
            .get("payload")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params("missing payload"))?
            .to_string();
        let defaults: BatchDefaults = match params.get("defaults") {
            None | Some(Value::Null) => BatchDefaults::default(),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| HandlerErr::bad_params(format!("defaults: {}", e)))?,
        };
        let request = ImportRequest {
            batch_id: batch_id.clone(),
            target,
            format,
            payload,
            defaults,
            policy: out_of_range_policy(ws, params)?,
            settings: settings::import_settings(&ws.store)?,
        };

        let cancel = state.cancels.register(&batch_id);
        let mut sink = IpcProgress {
            outbox: &state.outbox,
            request_id: &req.id,
            batch_id: &batch_id,
        };
        run_import(&ws.engine, &request, &mut sink, &cancel)
    };

    match outcome {
        Ok(report) => {
            let summary = json!(report.summary);
            state.remember_batch(FinishedBatch {
                summary: report.summary,
                issues: report.issues,
            });
            Ok(summary)
        }
        Err(aborted) => {
            let failure = HandlerErr {
                code: aborted.error.code(),
                message: aborted.to_string(),
                details: Some(json!({ "summary": aborted.report.summary })),
            };
            state.remember_batch(FinishedBatch {
                summary: aborted.report.summary,
                issues: aborted.report.issues,
            });
            Err(failure)
        }
    }
}

fn import_issues(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = state
        .batches
        .iter()
        .find(|b| b.summary.batch_id == batch_id)
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: format!("no finished batch {}", batch_id),
            details: None,
        })?;
    Ok(json!({
        "batchId": batch_id,
        "total": batch.issues.len(),
        "issues": batch.issues,
    }))
}

fn import_template(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let target_raw = get_required_str(params, "target")?;
    let target = ImportTarget::parse(&target_raw)
        .ok_or_else(|| HandlerErr::bad_params("target must be one of: roster, scores, mock"))?;

    let config = match (
        target,
        get_opt_str(params, "department"),
        get_opt_str(params, "academicYear"),
        get_opt_str(params, "term"),
        get_opt_str(params, "assessmentType"),
    ) {
        (ImportTarget::Scores, Some(d), Some(y), Some(t), Some(kind)) => {
            let ws = workspace(state)?;
            Some(
                ws.engine
                    .assessment_config(&GradingScope::new(&d, &y, &t), &kind)?,
            )
        }
        _ => None,
    };
    let headers = template_headers(target, config.as_ref());
    let csv: Vec<String> = headers.iter().map(|h| csv_quote(h)).collect();
    Ok(json!({
        "target": target,
        "headers": headers,
        "csv": format!("{}\n", csv.join(",")),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "import.run" => {
            let result = import_run(state, req);
            if let Some(batch_id) = get_opt_str(&req.params, "batchId") {
                state.cancels.remove(&batch_id);
            }
            result
        }
        "import.cancel" => return Some(handle_cancel(&state.cancels, req)),
        "import.issues" => import_issues(state, &req.params),
        "import.template" => import_template(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

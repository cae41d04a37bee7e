mod db;
mod engine;
mod error;
mod grading;
mod import;
mod ipc;
mod logging;
mod ranking;
mod scoring;
mod settings;
mod store;
mod tabular;

use std::io::{self, BufRead};
use std::sync::mpsc;
use std::thread;

fn main() {
    if let Err(e) = logging::init_tracing() {
        eprintln!("resultsd: logging disabled: {e:#}");
    }

    let outbox = ipc::Outbox::stdout();
    let cancels = ipc::CancelRegistry::default();

    // Requests run one at a time on the worker; the reader stays free to
    // answer cancels while an import is in flight.
    let (tx, rx) = mpsc::channel::<ipc::Request>();
    let worker = {
        let mut state = ipc::AppState::new(outbox.clone(), cancels.clone());
        thread::spawn(move || {
            for req in rx {
                let resp = ipc::handle_request(&mut state, req);
                state.outbox.send(&resp);
            }
        })
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resultsd ready");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                outbox.send(&serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                }));
                continue;
            }
        };

        match ipc::handle_inline(&cancels, req) {
            Ok(req) => {
                if tx.send(req).is_err() {
                    tracing::error!("worker stopped, exiting");
                    break;
                }
            }
            Err(resp) => outbox.send(&resp),
        }
    }

    drop(tx);
    if worker.join().is_err() {
        tracing::error!("worker panicked");
    }
}

use peerassessd::{config, ipc, logging};
use std::io::{self, BufRead, Write};
use tracing::{debug, info, warn};

fn main() {
    logging::init("peerassessd=info");
    info!(version = env!("CARGO_PKG_VERSION"), "peerassessd starting");

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        config: config::Config::default(),
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed with error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No request id to answer to; reply with an id-less error.
                warn!(error = %e, "undecodable request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    ipc::err("", "bad_json", e.to_string(), None)
                );
                let _ = stdout.flush();
                continue;
            }
        };

        debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    info!("stdin closed, exiting");
}

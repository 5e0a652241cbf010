mod attendance;
mod auth;
mod db;
mod ipc;
mod notify;

use std::io::{self, BufRead, Write};

fn init_logging() -> Option<flexi_logger::LoggerHandle> {
    // stdout carries the line protocol; all diagnostics go to stderr.
    let result = flexi_logger::Logger::try_with_env_or_str("info")
        .and_then(|logger| logger.log_to_stderr().start());
    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("logger init failed: {e}");
            None
        }
    }
}

fn main() {
    // Keep the handle alive for the process lifetime; dropping it stops the logger.
    let _logger = init_logging();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

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
                // Can't reply without id; report and move on.
                log::warn!("unparseable request line: {e}");
                let _ = writeln!(
                    stdout,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
                let _ = stdout.flush();
                continue;
            }
        };

        log::debug!("request id={} method={}", req.id, req.method);
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}

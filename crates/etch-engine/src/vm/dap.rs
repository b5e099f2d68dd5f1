//! Debug Adapter Protocol server.
//!
//! Line-oriented JSON over TCP (when `ETCH_DEBUG_PORT` is set and the context
//! is in debug mode) or over stdio. The server owns the socket; the VM side
//! of the conversation goes through the shared `DebugState`.

use super::debug::{DebugState, PauseInfo, StepMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long `wait_for_pause` blocks after a resume before rechecking.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Environment variable naming the TCP port.
pub const DEBUG_PORT_ENV: &str = "ETCH_DEBUG_PORT";

/// Environment variable bounding the wait for the first client (ms).
pub const DEBUG_TIMEOUT_ENV: &str = "ETCH_DEBUG_TIMEOUT";

/// Default first-client wait.
pub const DEFAULT_DEBUG_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    seq: u64,
    #[serde(rename = "type", default)]
    _kind: String,
    command: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    request_seq: u64,
    success: bool,
    command: String,
    body: Value,
}

#[derive(Debug, Serialize)]
struct Event {
    seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'static str,
    body: Value,
}

/// Read the configured first-client timeout.
pub fn configured_timeout() -> Duration {
    let ms = std::env::var(DEBUG_TIMEOUT_ENV)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_DEBUG_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Serve DAP over TCP on a background thread. If no client connects within
/// `timeout`, the debugger detaches and the VM runs free.
pub fn serve_tcp(
    state: Arc<DebugState>,
    port: u16,
    timeout: Duration,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    listener.set_nonblocking(true)?;
    let handle = std::thread::spawn(move || {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break Some(stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => break None,
            }
        };
        match stream {
            Some(stream) => {
                let _ = stream.set_nonblocking(false);
                serve_client(state, stream);
            }
            None => {
                // Nobody came; let the program run.
                state.disconnect();
            }
        }
    });
    Ok(handle)
}

fn serve_client(state: Arc<DebugState>, stream: TcpStream) {
    let reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });
    let mut session = Session {
        state,
        out: Box::new(stream),
        seq: 0,
        last_depth: 1,
    };
    session.run(reader.lines().filter_map(|l| l.ok()));
}

/// Serve DAP over stdin/stdout (the inline variant started by the host).
pub fn serve_stdio(state: Arc<DebugState>) {
    let stdin = std::io::stdin();
    let reader = BufReader::new(stdin);
    let mut session = Session {
        state,
        out: Box::new(std::io::stdout()),
        seq: 0,
        last_depth: 1,
    };
    session.run(reader.lines().filter_map(|l| l.ok()));
}

struct Session {
    state: Arc<DebugState>,
    out: Box<dyn Write + Send>,
    seq: u64,
    last_depth: usize,
}

impl Session {
    fn run(&mut self, lines: impl Iterator<Item = String>) {
        for line in lines {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let request: Request = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !self.handle(request) {
                break;
            }
        }
        self.state.disconnect();
    }

    /// Handle one request; false ends the session.
    fn handle(&mut self, request: Request) -> bool {
        match request.command.as_str() {
            "initialize" => {
                self.respond(
                    &request,
                    json!({
                        "supportsConfigurationDoneRequest": true,
                        "supportsConditionalBreakpoints": false,
                    }),
                );
                self.event("initialized", json!({}));
            }
            "setBreakpoints" => {
                let path = request.arguments["source"]["path"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let lines: Vec<u32> = request.arguments["lines"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect())
                    .unwrap_or_default();
                self.state.set_breakpoints(&path, &lines);
                let verified: Vec<Value> = lines
                    .iter()
                    .map(|line| json!({"verified": true, "line": line}))
                    .collect();
                self.respond(&request, json!({ "breakpoints": verified }));
            }
            "configurationDone" => {
                self.respond(&request, json!({}));
            }
            "threads" => {
                self.respond(
                    &request,
                    json!({"threads": [{"id": 1, "name": "main"}]}),
                );
            }
            "stackTrace" => {
                let frames: Vec<Value> = self
                    .state
                    .wait_for_pause(Duration::from_millis(1))
                    .map(|info| {
                        vec![json!({
                            "id": 1,
                            "name": info.function,
                            "line": info.line,
                            "column": info.col,
                            "source": {"path": info.file},
                        })]
                    })
                    .unwrap_or_default();
                let total = frames.len();
                self.respond(
                    &request,
                    json!({"stackFrames": frames, "totalFrames": total}),
                );
            }
            "continue" => {
                self.respond(&request, json!({"allThreadsContinued": true}));
                self.resume_and_report(StepMode::Continue);
            }
            "next" => {
                self.respond(&request, json!({}));
                let depth = self.last_depth;
                self.resume_and_report(StepMode::StepOver {
                    target_depth: depth,
                });
            }
            "stepIn" => {
                self.respond(&request, json!({}));
                self.resume_and_report(StepMode::StepIn);
            }
            "stepOut" => {
                self.respond(&request, json!({}));
                let depth = self.last_depth;
                self.resume_and_report(StepMode::StepOut {
                    target_depth: depth,
                });
            }
            "disconnect" => {
                self.respond(&request, json!({}));
                return false;
            }
            _ => {
                self.respond(&request, json!({}));
            }
        }
        true
    }

    fn resume_and_report(&mut self, mode: StepMode) {
        self.state.resume(mode);
        // Block until the VM pauses again or finishes.
        loop {
            match self.state.wait_for_pause(PAUSE_POLL) {
                Some(info) => {
                    self.report_stop(&info);
                    return;
                }
                None => {
                    if self.state.is_terminated() {
                        self.event("terminated", json!({}));
                        return;
                    }
                    // Timeout while still running; keep waiting.
                }
            }
        }
    }

    fn report_stop(&mut self, info: &PauseInfo) {
        self.last_depth = info.depth;
        self.event(
            "stopped",
            json!({
                "reason": info.reason.as_str(),
                "threadId": 1,
                "line": info.line,
                "column": info.col,
                "source": {"path": info.file},
                "function": info.function,
            }),
        );
    }

    fn respond(&mut self, request: &Request, body: Value) {
        self.seq += 1;
        let response = Response {
            seq: self.seq,
            kind: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            body,
        };
        self.send(&serde_json::to_string(&response).unwrap_or_default());
    }

    fn event(&mut self, event: &'static str, body: Value) {
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            kind: "event",
            event,
            body,
        };
        self.send(&serde_json::to_string(&event).unwrap_or_default());
    }

    fn send(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpStream;

    #[test]
    fn test_tcp_session_round_trip() {
        let state = Arc::new(DebugState::new());
        state.activate();
        let port = 47123;
        let Ok(server) = serve_tcp(state.clone(), port, Duration::from_secs(5)) else {
            // Port already taken on this machine; nothing to assert.
            return;
        };

        let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        let mut reader = BufReader::new(client.try_clone().unwrap());

        writeln!(
            client,
            r#"{{"seq":1,"type":"request","command":"initialize"}}"#
        )
        .unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("\"response\""));
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("initialized"));

        writeln!(
            client,
            r#"{{"seq":2,"type":"request","command":"setBreakpoints","arguments":{{"source":{{"path":"t.etch"}},"lines":[3,7]}}}}"#
        )
        .unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("\"verified\":true"));
        assert!(state.should_break("t.etch", 3, 1).is_some());

        writeln!(
            client,
            r#"{{"seq":3,"type":"request","command":"disconnect"}}"#
        )
        .unwrap();
        let _ = server.join();
    }
}

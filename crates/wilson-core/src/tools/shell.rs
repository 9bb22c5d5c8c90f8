//! Shell tool: foreground and background command execution.
//!
//! Commands auto-classify into background when they match the long-running
//! set (dev servers, watchers, databases) or when the model asks for it.
//! Background children are detached into the process registry and the result
//! carries a `_terminal` marker; the loop stops iterating once a server is
//! up. Foreground commands run under a timeout with capped output capture.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::process::{terminate_tree, TailBuffer};
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolOutput, ToolOutputChunk};

/// Foreground output cap fed back to the model.
const MAX_CAPTURE_BYTES: usize = 100 * 1024;

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const MAX_TIMEOUT_MS: u64 = 600_000;

/// How long to watch a background child's startup output for a listen URL.
const STARTUP_WINDOW: Duration = Duration::from_secs(2);
const STARTUP_POLL: Duration = Duration::from_millis(100);

static LONG_RUNNING: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bnpm\s+(run\s+)?(dev|start|serve)\b",
        r"(?i)\byarn\s+(dev|start|serve)\b",
        r"(?i)\bpnpm\s+(run\s+)?(dev|start)\b",
        r"(?i)\bbun\s+(run\s+)?dev\b",
        r"(?i)\bvite\b",
        r"(?i)\bnext\s+(dev|start)\b",
        r"(?i)\bnuxt\b",
        r"(?i)\bwebpack\b.*(--watch|serve)",
        r"(?i)\bnodemon\b",
        r"(?i)\bcargo\s+watch\b",
        r"(?i)\bpython[0-9.]*\s+-m\s+http\.server\b",
        r"(?i)\b(http-server|live-server)\b",
        r"(?i)\bflask\s+run\b",
        r"(?i)\b(uvicorn|gunicorn)\b",
        r"(?i)\brails\s+s(erver)?\b",
        r"(?i)\bphp\s+-S\b",
        r"(?i)\btail\s+-f\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

/// Programs that are servers no matter how they are invoked.
const SERVER_PROGRAMS: &[&str] = &[
    "mongod",
    "postgres",
    "mysqld",
    "redis-server",
    "nodemon",
    "vite",
    "http-server",
    "live-server",
    "uvicorn",
    "gunicorn",
];

static LISTEN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[0-9A-Za-z.\-]+(:\d+)?(/\S*)?|(localhost|127\.0\.0\.1|0\.0\.0\.0):\d+")
        .expect("static pattern compiles")
});

static ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("static pattern compiles")
});

/// True when the command matches the long-running set and should run
/// detached.
pub fn is_long_running(command: &str) -> bool {
    if LONG_RUNNING.iter().any(|re| re.is_match(command)) {
        return true;
    }
    // Also classify by the invoked program itself, path-stripped.
    if let Ok(words) = shell_words::split(command) {
        if let Some(first) = words.first() {
            let program = first.rsplit('/').next().unwrap_or(first);
            return SERVER_PROGRAMS.contains(&program);
        }
    }
    false
}

/// Scan startup output for a listening URL.
fn find_listen_url(output: &str) -> Option<String> {
    let m = LISTEN_URL.find(output)?;
    let raw = m.as_str();
    if raw.starts_with("http") {
        Some(raw.to_string())
    } else {
        Some(format!("http://{}", raw))
    }
}

fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").into_owned()
}

pub struct ShellTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    run_in_background: Option<bool>,
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute shell commands. Long-running servers and watchers are detached \
         automatically and tracked in the process registry; everything else runs \
         in the foreground with a timeout."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Optional timeout in milliseconds (max 600000)"
                },
                "description": {
                    "type": "string",
                    "description": "What this command does, in a few words"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Force background execution"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput {
        let params = match parse_params::<Params>(input) {
            Ok(p) => p,
            Err(e) => return e,
        };

        match &params.description {
            Some(desc) => tracing::info!(command = %params.command, description = %desc, "executing shell command"),
            None => tracing::info!(command = %params.command, "executing shell command"),
        }

        let background = params.run_in_background.unwrap_or(false) || is_long_running(&params.command);
        if background {
            return execute_background(&params.command, ctx).await;
        }

        let timeout_ms = params
            .timeout
            .or_else(|| ctx.timeout.map(|d| d.as_millis() as u64))
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .min(MAX_TIMEOUT_MS);
        execute_foreground(&params.command, Duration::from_millis(timeout_ms), ctx).await
    }
}

/// Detach the command into the process registry and watch its startup output
/// for a listening URL. The result is terminal: a started server ends the
/// agent turn.
async fn execute_background(command: &str, ctx: &ToolContext) -> ToolOutput {
    let Some(registry) = &ctx.process_registry else {
        return ToolOutput::failure("process registry unavailable; cannot run in background");
    };

    let spawned = match registry.spawn(command, &ctx.working_dir).await {
        Ok(s) => s,
        Err(e) => return ToolOutput::failure(format!("Failed to start background process: {}", e)),
    };

    // Watch the rolling tail for a listen URL within the startup window.
    let deadline = tokio::time::Instant::now() + STARTUP_WINDOW;
    let mut url = None;
    while tokio::time::Instant::now() < deadline {
        {
            let tail = spawned.tail.lock();
            url = find_listen_url(&tail.contents());
        }
        if url.is_some() {
            break;
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }

    let content = match &url {
        Some(url) => format!("Server is now running at {} (PID: {})", url, spawned.pid),
        None => format!("Process started in background (PID: {})", spawned.pid),
    };
    tracing::info!(pid = spawned.pid, url = ?url, "background command started");

    let mut output = ToolOutput::success(content)
        .with_extra("_terminal", Value::Bool(true))
        .with_extra("pid", json!(spawned.pid));
    if let Some(url) = url {
        output = output.with_extra("url", Value::String(url));
    }
    output
}

async fn execute_foreground(command: &str, timeout_duration: Duration, ctx: &ToolContext) -> ToolOutput {
    let mut cmd = build_command(command, ctx);
    cmd.kill_on_drop(true);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ToolOutput::failure(format!("Failed to spawn command: {}", e)),
    };
    let pid = child.id();

    let capture = Arc::new(parking_lot::Mutex::new(CaptureBuffer::new(MAX_CAPTURE_BYTES)));
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(collect_pipe(stdout, Arc::clone(&capture), stream_ctx(ctx)));
    let stderr_task = tokio::spawn(collect_pipe(stderr, Arc::clone(&capture), stream_ctx(ctx)));

    let waited = tokio::select! {
        waited = timeout(timeout_duration, child.wait()) => Some(waited),
        _ = ctx.cancel.cancelled() => None,
    };

    let (exit_code, timed_out, cancelled) = match waited {
        Some(Ok(Ok(status))) => (exit_code_of(status), false, false),
        Some(Ok(Err(e))) => {
            tracing::error!("process wait failed: {}", e);
            (-1, false, false)
        }
        Some(Err(_)) => {
            if let Some(pid) = pid {
                terminate_tree(pid).await;
            }
            let _ = child.wait().await;
            (-1, true, false)
        }
        None => {
            if let Some(pid) = pid {
                terminate_tree(pid).await;
            }
            let _ = child.wait().await;
            (-1, false, true)
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if let (Some(tx), Some(id)) = (&ctx.output_tx, &ctx.tool_use_id) {
        let _ = tx.send(ToolOutputChunk {
            tool_use_id: id.clone(),
            chunk: String::new(),
            is_complete: true,
            exit_code: Some(exit_code),
        });
    }

    let output_text = {
        let capture = capture.lock();
        let stripped = strip_ansi(&capture.text());
        if capture.truncated() {
            format!(
                "{}\n[Output truncated: kept last {} of {} bytes]",
                stripped,
                stripped.len(),
                capture.total_bytes
            )
        } else {
            stripped
        }
    };

    if cancelled {
        ToolOutput::cancelled("Command cancelled").with_extra("output", Value::String(output_text))
    } else if timed_out {
        ToolOutput::failure(format!(
            "Command timed out after {} ms",
            timeout_duration.as_millis()
        ))
        .with_extra("output", Value::String(output_text))
        .with_extra("timeout", Value::Bool(true))
    } else if exit_code == 0 {
        ToolOutput::success(output_text).with_extra("exit_code", json!(0))
    } else {
        ToolOutput::failure(format!("Command exited with code {}", exit_code))
            .with_extra("output", Value::String(output_text))
            .with_extra("exit_code", json!(exit_code))
    }
}

fn build_command(command: &str, ctx: &ToolContext) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        #[cfg(unix)]
        {
            c.process_group(0);
        }
        c
    };
    cmd.env("NO_COLOR", "1");
    cmd.current_dir(&ctx.working_dir);
    cmd
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[derive(Clone)]
struct StreamCtx {
    tx: tokio::sync::mpsc::UnboundedSender<ToolOutputChunk>,
    tool_use_id: String,
}

fn stream_ctx(ctx: &ToolContext) -> Option<StreamCtx> {
    match (&ctx.output_tx, &ctx.tool_use_id) {
        (Some(tx), Some(id)) => Some(StreamCtx {
            tx: tx.clone(),
            tool_use_id: id.clone(),
        }),
        _ => None,
    }
}

/// Capture buffer: rolling tail plus a flag recording whether anything was
/// dropped, so the truncation can be noted in the final output.
struct CaptureBuffer {
    tail: TailBuffer,
    total_bytes: usize,
    cap: usize,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            tail: TailBuffer::new(cap),
            total_bytes: 0,
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.total_bytes += line.len() + 1;
        self.tail.push_line(line);
    }

    fn truncated(&self) -> bool {
        self.total_bytes > self.cap
    }

    fn text(&self) -> String {
        self.tail.contents()
    }
}

async fn collect_pipe<R>(
    pipe: Option<R>,
    capture: Arc<parking_lot::Mutex<CaptureBuffer>>,
    stream: Option<StreamCtx>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(stream) = &stream {
            let _ = stream.tx.send(ToolOutputChunk {
                tool_use_id: stream.tool_use_id.clone(),
                chunk: format!("{}\n", line),
                is_complete: false,
                exit_code: None,
            });
        }
        capture.lock().push_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use std::path::PathBuf;

    fn test_ctx() -> ToolContext {
        ToolContext::new(PathBuf::from("."))
    }

    #[test]
    fn long_running_classification() {
        assert!(is_long_running("npm run dev"));
        assert!(is_long_running("yarn dev"));
        assert!(is_long_running("npx vite --port 5173"));
        assert!(is_long_running("next dev"));
        assert!(is_long_running("python3 -m http.server 8000"));
        assert!(is_long_running("redis-server"));
        assert!(is_long_running("tail -f app.log"));

        assert!(!is_long_running("cargo build"));
        assert!(!is_long_running("ls -la"));
        assert!(!is_long_running("git status"));
        assert!(!is_long_running("npm install"));
    }

    #[test]
    fn listen_url_discovery() {
        assert_eq!(
            find_listen_url("ready - started server on http://localhost:3000"),
            Some("http://localhost:3000".to_string())
        );
        assert_eq!(
            find_listen_url("Listening on 127.0.0.1:8080"),
            Some("http://127.0.0.1:8080".to_string())
        );
        assert_eq!(find_listen_url("compiling..."), None);
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        assert_eq!(strip_ansi("\x1b[32mok\x1b[0m"), "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn foreground_captures_output() {
        let out = ShellTool
            .execute(json!({"command": "echo hello"}), &test_ctx())
            .await;
        assert!(out.success);
        assert_eq!(out.summary().trim(), "hello");
        assert_eq!(out.extras["exit_code"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn foreground_reports_nonzero_exit() {
        let out = ShellTool
            .execute(json!({"command": "echo bad >&2; exit 3"}), &test_ctx())
            .await;
        assert!(!out.success);
        assert!(out.summary().contains("code 3"));
        assert!(out.extras["output"].as_str().unwrap().contains("bad"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let start = std::time::Instant::now();
        let out = ShellTool
            .execute(json!({"command": "sleep 30", "timeout": 200}), &test_ctx())
            .await;
        assert!(!out.success);
        assert!(out.summary().contains("timed out"));
        assert_eq!(out.extras["timeout"], true);
        // Bounded by timeout + TERM grace, nowhere near the sleep duration.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_registers_and_terminates_turn() {
        let registry = Arc::new(ProcessRegistry::new());
        let ctx = test_ctx().with_process_registry(Arc::clone(&registry));
        let out = ShellTool
            .execute(
                json!({"command": "echo serving at http://localhost:4000; sleep 5", "run_in_background": true}),
                &ctx,
            )
            .await;

        assert!(out.success);
        assert!(out.is_terminal());
        let pid = out.pid().expect("pid extra");
        assert!(registry.get(pid).await.is_some());
        assert!(out.summary().contains("http://localhost:4000"));

        registry.kill_all().await;
    }
}

//! Subprocess assistant
//!
//! Runs the configured command once per turn:
//!
//! ```text
//! <command> --print [--resume <id>] [--dangerously-skip-permissions]
//! ```
//!
//! The composed prompt goes to stdin; stdout is the reply and stderr carries
//! diagnostics (including the continuation id). The child runs in its own
//! process group so a timeout can kill everything it started.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn, Span};

use crate::config::{ConfigError, RelayConfig};

use super::{
    classify_failure, Assistant, AssistantError, AssistantReply, AssistantRequest,
    ContinuationExtractor,
};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Assistant backed by an external command-line tool
#[derive(Clone, Debug)]
pub struct CliAssistant {
    command: String,
    default_dir: PathBuf,
    timeout: Duration,
    skip_permissions: bool,
    extractor: ContinuationExtractor,
    span: Span,
}

impl CliAssistant {
    /// Create an assistant running `command` with the given deadline
    pub fn new(command: impl Into<String>, default_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            default_dir: default_dir.into(),
            timeout,
            skip_permissions: false,
            extractor: ContinuationExtractor { patterns: Vec::new() },
            span: Span::none(),
        }
    }

    /// Build from relay configuration
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] if a continuation pattern is invalid.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let extractor = ContinuationExtractor::new(config.continuation_patterns.as_slice())
            .map_err(|e| ConfigError::ValidationError(format!("continuation pattern: {e}")))?;
        Ok(Self::new(
            config.assistant_command.clone(),
            config.default_working_dir.clone(),
            config.command_timeout,
        )
        .with_skip_permissions(config.skip_permissions)
        .with_extractor(extractor))
    }

    /// Pass the permission-bypass flag on every call
    #[must_use]
    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    /// Set the continuation-id patterns
    #[must_use]
    pub fn with_extractor(mut self, extractor: ContinuationExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Attach the span turns are logged under
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Argument vector for one turn
    pub fn build_args(&self, request: &AssistantRequest) -> Vec<String> {
        let mut args = vec!["--print".to_string()];
        if let Some(id) = &request.continuation_id {
            args.push("--resume".to_string());
            args.push(id.clone());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }

    fn command(&self, args: &[String], dir: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(args)
            .current_dir(dir)
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) {
                // SAFETY: kill(2) has no memory-safety preconditions; a negative
                // pid addresses the process group created for this child.
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if let Err(e) = child.kill().await {
            warn!(parent: &self.span, error = %e, "Failed to reap timed-out assistant");
        }
    }
}

#[async_trait]
impl Assistant for CliAssistant {
    fn name(&self) -> &str {
        &self.command
    }

    async fn send(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        let args = self.build_args(request);
        let prompt = request.compose_prompt();
        debug!(
            parent: &self.span,
            command = %self.command,
            args = ?args,
            cwd = %request.working_dir.display(),
            prompt_chars = prompt.chars().count(),
            "Running assistant"
        );

        let started = Instant::now();
        let mut child = self
            .command(&args, &request.working_dir)
            .spawn()
            .map_err(AssistantError::Spawn)?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let write = async move {
                if let Some(mut stdin) = stdin {
                    match stdin.write_all(prompt.as_bytes()).await {
                        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                        _ => {}
                    }
                }
                Ok(())
            };
            let (written, out, err) = tokio::join!(write, read_stream(stdout), read_stream(stderr));
            written?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out?, err?))
        };

        let (status, out, err) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(parent: &self.span, timeout = ?self.timeout, pid = ?pid, "Assistant timed out, killing process group");
                self.terminate(&mut child, pid).await;
                return Err(AssistantError::Timeout { after: self.timeout });
            }
        };

        let elapsed = started.elapsed();
        if !status.success() {
            error!(parent: &self.span, status = ?status.code(), elapsed = ?elapsed, stderr = %err.trim(), "Assistant exited with failure");
            return Err(classify_failure(&err, status.code()));
        }

        let continuation_id = self.extractor.extract(&err);
        info!(
            parent: &self.span,
            elapsed = ?elapsed,
            reply_chars = out.trim().chars().count(),
            continuation = continuation_id.is_some(),
            "Assistant turn complete"
        );
        Ok(AssistantReply {
            text: out.trim().to_string(),
            continuation_id,
            exit_code: status.code().unwrap_or(0),
        })
    }

    async fn health_check(&self) -> bool {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--version")
            .current_dir(&self.default_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!(parent: &self.span, version = %version.trim(), "Assistant available");
                true
            }
            Ok(Ok(output)) => {
                warn!(parent: &self.span, status = ?output.status.code(), "Assistant version check failed");
                false
            }
            Ok(Err(e)) => {
                warn!(parent: &self.span, error = %e, command = %self.command, "Assistant not runnable");
                false
            }
            Err(_) => {
                warn!(parent: &self.span, "Assistant version check timed out");
                false
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

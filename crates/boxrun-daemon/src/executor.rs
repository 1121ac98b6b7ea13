//! Agent execution via subprocess.
//!
//! Each task runs the configured agent command once. Output is read in raw
//! chunks from stdout and stderr and forwarded as [`LogEvent`]s as soon as it
//! arrives, so fragments are not necessarily whole lines.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use boxrun_core::{LogEvent, LogEventType};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::tasks::TaskSpec;

/// Environment variable the agent reads its API key from.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const READ_CHUNK: usize = 4096;

/// Agent program plus argument template.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Substitute `{prompt}`, `{model}` and `{work_dir}` in the argument template.
    pub fn render_args(&self, spec: &TaskSpec) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{prompt}", &spec.prompt)
                    .replace("{model}", &spec.model)
                    .replace("{work_dir}", &spec.work_dir)
            })
            .collect()
    }
}

/// Runs agent processes.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    command: AgentCommand,
}

impl AgentRunner {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(AgentCommand::new(
            config.agent_program.clone(),
            config.agent_args.clone(),
        ))
    }

    /// Run the agent for `spec`, streaming output through `events`.
    ///
    /// Returns the process exit code once both output pipes are drained
    /// (`-1` if the process was killed by a signal).
    pub async fn run(
        &self,
        spec: &TaskSpec,
        events: mpsc::Sender<LogEvent>,
    ) -> Result<i32, DaemonError> {
        let args = self.command.render_args(spec);
        info!(
            program = %self.command.program,
            work_dir = %spec.work_dir,
            model = %spec.model,
            prompt_len = spec.prompt.len(),
            "Starting agent process"
        );

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !spec.api_key.is_empty() {
            cmd.env(API_KEY_ENV, &spec.api_key);
        }

        if !spec.work_dir.is_empty() {
            if Path::new(&spec.work_dir).is_dir() {
                cmd.current_dir(&spec.work_dir);
            } else {
                warn!(work_dir = %spec.work_dir, "Work dir does not exist, using daemon cwd");
            }
        }

        let mut child = cmd.spawn().map_err(|source| DaemonError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = stdout.map(|pipe| {
            let tx = events.clone();
            tokio::spawn(pump(pipe, LogEventType::Stdout, tx))
        });
        let stderr_task = stderr.map(|pipe| {
            let tx = events.clone();
            tokio::spawn(pump(pipe, LogEventType::Stderr, tx))
        });

        let status = child.wait().await.map_err(DaemonError::Wait)?;

        for handle in [stdout_task, stderr_task].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Output reader task failed");
            }
        }

        let code = status.code().unwrap_or(-1);
        info!(exit_code = code, "Agent process exited");
        Ok(code)
    }
}

/// Forward raw chunks from a pipe until EOF.
async fn pump<R>(mut pipe: R, event_type: LogEventType, tx: mpsc::Sender<LogEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let content = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(LogEvent::new(event_type, content)).await.is_err() {
                    debug!("Event receiver dropped, stopping reader");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, stream = %event_type, "Failed to read agent output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_runner() -> AgentRunner {
        AgentRunner::new(AgentCommand::new(
            "sh",
            vec!["-c".to_string(), "{prompt}".to_string()],
        ))
    }

    #[test]
    fn test_render_args() {
        let command = AgentCommand::new(
            "claude",
            vec![
                "--print".to_string(),
                "{prompt}".to_string(),
                "--model={model}".to_string(),
            ],
        );
        let spec = TaskSpec {
            prompt: "fix the bug".to_string(),
            model: "opus".to_string(),
            ..Default::default()
        };
        assert_eq!(
            command.render_args(&spec),
            vec!["--print", "fix the bug", "--model=opus"]
        );
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_stderr() {
        let (tx, mut rx) = mpsc::channel(16);
        let spec = TaskSpec {
            prompt: "echo hi; echo oops 1>&2; exit 3".to_string(),
            ..Default::default()
        };

        let code = shell_runner().run(&spec, tx).await.unwrap();
        assert_eq!(code, 3);

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(event) = rx.recv().await {
            match event.event_type {
                LogEventType::Stdout => stdout.push_str(&event.content),
                LogEventType::Stderr => stderr.push_str(&event.content),
                _ => {}
            }
        }
        assert_eq!(stdout, "hi\n");
        assert_eq!(stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = AgentRunner::new(AgentCommand::new("/nonexistent/agent", vec![]));
        let (tx, _rx) = mpsc::channel(1);
        let result = runner.run(&TaskSpec::default(), tx).await;
        assert!(matches!(result, Err(DaemonError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_env_and_api_key_passed() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut spec = TaskSpec {
            prompt: format!("printf '%s-%s' \"$GREETING\" \"${API_KEY_ENV}\""),
            api_key: "sk-test".to_string(),
            ..Default::default()
        };
        spec.env.insert("GREETING".to_string(), "hello".to_string());

        shell_runner().run(&spec, tx).await.unwrap();
        let mut out = String::new();
        while let Some(event) = rx.recv().await {
            out.push_str(&event.content);
        }
        assert_eq!(out, "hello-sk-test");
    }
}

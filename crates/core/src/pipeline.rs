//! Process pipelines with pipe-status reporting.
//!
//! The incremental transfer runs as `producer | buffer | consumer`, each stage
//! an independent process connected to the next by an OS pipe. All stages are
//! awaited and a failure in any of them fails the pipeline, the way a shell
//! with `set -o pipefail` reports the rightmost non-zero stage.

use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

use crate::errors::ZfsError;

/// A single pipeline stage: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
}

impl Stage {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a stage from an argv vector; `None` when it is empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status of one stage after the pipeline finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub command: String,
    pub code: i32,
    pub stderr: String,
}

/// Combined status of a finished pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeStatus {
    pub stages: Vec<StageStatus>,
}

impl PipeStatus {
    /// Status for a pipeline that was never run (dry-run and test backends).
    pub fn succeeded(commands: &[String]) -> Self {
        Self {
            stages: commands
                .iter()
                .map(|command| StageStatus {
                    command: command.clone(),
                    code: 0,
                    stderr: String::new(),
                })
                .collect(),
        }
    }

    /// Rightmost non-zero stage code, or 0.
    pub fn code(&self) -> i32 {
        self.stages
            .iter()
            .rev()
            .map(|stage| stage.code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    pub fn success(&self) -> bool {
        self.code() == 0
    }

    /// The stages that exited non-zero.
    pub fn failed_stages(&self) -> impl Iterator<Item = &StageStatus> {
        self.stages.iter().filter(|stage| stage.code != 0)
    }

    /// One-line summary of the failing stages.
    pub fn failure_summary(&self) -> String {
        self.failed_stages()
            .map(|stage| {
                let stderr = stage.stderr.trim();
                if stderr.is_empty() {
                    format!("`{}` exited {}", stage.command, stage.code)
                } else {
                    format!("`{}` exited {}: {}", stage.command, stage.code, stderr)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Render stages as a shell-style pipeline for logs.
pub fn describe(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::command_line)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Run `stages` as a connected pipeline and wait for every stage.
///
/// Spawn failures are returned as errors (remaining started stages are
/// killed); non-zero exits are reported through the returned [`PipeStatus`].
#[instrument(skip_all, fields(pipeline = %describe(stages)))]
pub async fn run_pipeline(stages: &[Stage]) -> Result<PipeStatus, ZfsError> {
    if stages.is_empty() {
        return Ok(PipeStatus::default());
    }

    let mut children: Vec<(String, Child)> = Vec::with_capacity(stages.len());
    let mut upstream: Option<Stdio> = None;

    for (index, stage) in stages.iter().enumerate() {
        let is_last = index + 1 == stages.len();
        let mut cmd = Command::new(&stage.program);
        cmd.args(&stage.args)
            .stdin(upstream.take().unwrap_or_else(Stdio::null))
            .stdout(if is_last { Stdio::null() } else { Stdio::piped() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(stage = index, cmd = %stage.command_line(), "spawning pipeline stage");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                for (_, started) in children.iter_mut() {
                    let _ = started.start_kill();
                }
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    ZfsError::BinaryNotFound(stage.program.clone())
                } else {
                    ZfsError::IoError(e)
                });
            }
        };

        if !is_last {
            let stdout = child.stdout.take().ok_or_else(|| {
                ZfsError::IoError(std::io::Error::other("pipeline stage has no stdout"))
            })?;
            upstream = Some(stdout.try_into()?);
        }
        children.push((stage.command_line(), child));
    }

    // Wait on every stage concurrently so no stage blocks on a full stderr pipe.
    let handles: Vec<_> = children
        .into_iter()
        .map(|(command, child)| (command, tokio::spawn(child.wait_with_output())))
        .collect();

    let mut status = PipeStatus::default();
    for (command, handle) in handles {
        let output = handle
            .await
            .map_err(|e| ZfsError::IoError(std::io::Error::other(e)))??;
        let code = exit_code(&output.status);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if code != 0 {
            warn!(cmd = %command, code, stderr = %stderr.trim(), "pipeline stage failed");
        }
        status.stages.push(StageStatus {
            command,
            code,
            stderr,
        });
    }

    debug!(code = status.code(), "pipeline finished");
    Ok(status)
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Stage {
        Stage::new("sh", ["-c", script])
    }

    #[test]
    fn test_pipe_status_rightmost_failure_wins() {
        let mut status = PipeStatus::succeeded(&["a".into(), "b".into(), "c".into()]);
        assert!(status.success());
        status.stages[0].code = 2;
        status.stages[1].code = 5;
        assert_eq!(status.code(), 5);
        assert_eq!(status.failed_stages().count(), 2);
    }

    #[test]
    fn test_describe() {
        let stages = vec![
            Stage::new("zfs", ["send", "-R", "-I", "a@1", "a@2"]),
            Stage::new("mbuffer", ["-q"]),
        ];
        assert_eq!(describe(&stages), "zfs send -R -I a@1 a@2 | mbuffer -q");
        assert!(Stage::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let status = run_pipeline(&[sh("echo hello"), Stage::new("cat", Vec::<String>::new()), sh("cat > /dev/null")])
            .await
            .unwrap();
        assert_eq!(status.stages.len(), 3);
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_middle_stage_failure_is_reported() {
        let status = run_pipeline(&[
            sh("echo data"),
            sh("cat > /dev/null; echo buffer broke >&2; exit 3"),
            sh("cat > /dev/null"),
        ])
        .await
        .unwrap();
        assert_eq!(status.stages[0].code, 0);
        assert_eq!(status.stages[2].code, 0);
        assert_eq!(status.code(), 3);
        assert!(!status.success());
        assert!(status.failure_summary().contains("buffer broke"));
    }

    #[tokio::test]
    async fn test_first_stage_failure_is_reported() {
        let status = run_pipeline(&[sh("exit 4"), sh("cat > /dev/null")])
            .await
            .unwrap();
        assert_eq!(status.code(), 4);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = run_pipeline(&[Stage::new("definitely-not-a-real-binary-zr", Vec::<String>::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, ZfsError::BinaryNotFound(_)));
    }
}

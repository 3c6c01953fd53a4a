//! ProcessWorker - メッセージ 1 件をシェルコマンドとして実行する Worker
//!
//! # 終了コードの扱い
//! - 0: 成功。メッセージを complete（削除）
//! - 3: reject。リトライ不要としてメッセージを complete
//! - それ以外 / シグナル終了 / タイムアウト: メッセージを retry して WorkerError
//!
//! メッセージの中身は環境変数（`Message`, `MessageId`, ...）で渡し、
//! volume のパスは `LOOKOUT_WORKER_VOLUMES` に `:` 区切りで渡します。

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::domain::{Message, WorkerOptions};
use crate::error::WorkerError;
use crate::ports::{MessageSource, Worker, WorkerFactory};

/// Exit code a command uses to reject a message it will never be able to handle.
pub const EXIT_REJECTED: i32 = 3;

pub const VOLUMES_ENV: &str = "LOOKOUT_WORKER_VOLUMES";

const DEFAULT_SHELL: &str = "/bin/sh";

/// Starts a `ProcessWorker` per message and acknowledges through `source`.
pub struct ProcessWorkerFactory {
    source: Arc<dyn MessageSource>,
    shell: PathBuf,
}

impl ProcessWorkerFactory {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            shell: PathBuf::from(DEFAULT_SHELL),
        }
    }

    /// Run commands through another shell (must accept `-c <command>`).
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    fn spawn(&self, message: &Message, options: &WorkerOptions) -> io::Result<Child> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&options.command)
            .envs(message.env())
            .env(VOLUMES_ENV, join_volumes(&options.volumes))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(message.id().to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(message.id().to_string(), "stderr", stderr));
        }
        Ok(child)
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, message: Message, options: Arc<WorkerOptions>) -> Box<dyn Worker> {
        let child = self.spawn(&message, &options);
        Box::new(ProcessWorker {
            message,
            options,
            source: Arc::clone(&self.source),
            child,
        })
    }
}

pub struct ProcessWorker {
    message: Message,
    options: Arc<WorkerOptions>,
    source: Arc<dyn MessageSource>,
    /// spawn に失敗した場合はエラーを保持し、wait_for で報告する
    child: io::Result<Child>,
}

async fn wait_child(
    child: &mut Child,
    id: &str,
    max_job_duration: Option<Duration>,
) -> Result<ExitStatus, WorkerError> {
    let io_err = |source| WorkerError::Io {
        id: id.to_string(),
        source,
    };
    let Some(limit) = max_job_duration else {
        return child.wait().await.map_err(io_err);
    };

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status.map_err(io_err),
        Err(_) => {
            warn!(message_id = %id, ?limit, "max job duration exceeded, killing worker");
            // kill failure means it already exited; the timeout still stands
            let _ = child.kill().await;
            Err(WorkerError::TimedOut { id: id.to_string() })
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn message(&self) -> &Message {
        &self.message
    }

    async fn wait_for(self: Box<Self>) -> Result<(), WorkerError> {
        let ProcessWorker {
            message,
            options,
            source,
            child,
        } = *self;
        let id = message.id().to_string();

        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                source.retry(&message).await?;
                return Err(WorkerError::Spawn { id, source: err });
            }
        };

        let status = match wait_child(&mut child, &id, options.max_job_duration).await {
            Ok(status) => status,
            Err(err) => {
                source.retry(&message).await?;
                return Err(err);
            }
        };

        match status.code() {
            Some(0) => {
                info!(message_id = %id, "worker completed");
                source.complete(&message).await?;
                Ok(())
            }
            Some(EXIT_REJECTED) => {
                info!(message_id = %id, "worker rejected message, discarding");
                source.complete(&message).await?;
                Ok(())
            }
            code => {
                let signal = exit_signal(&status);
                warn!(message_id = %id, ?code, ?signal, "worker failed, returning message");
                source.retry(&message).await?;
                Err(WorkerError::Failed { id, code, signal })
            }
        }
    }
}

fn join_volumes(volumes: &[PathBuf]) -> OsString {
    let mut joined = OsString::new();
    for (i, volume) in volumes.iter().enumerate() {
        if i > 0 {
            joined.push(":");
        }
        joined.push(volume);
    }
    joined
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn forward_lines<R>(message_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    // EOF まで読み切る。途中でやめると子プロセスが SIGPIPE で落ちる
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                info!(message_id = %message_id, stream, "{line}");
            }
            Err(e) => {
                warn!(message_id = %message_id, stream, error = %e, "stopped reading worker output");
                break;
            }
        }
    }
}

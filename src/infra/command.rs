//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 实时日志流式输出（按产生顺序写入事件通道）
//! - 超时控制
//! - 取消支持（事件接收端关闭时自动取消）

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::env::constants::LOG_TAIL_LINES;
use crate::domain::deploy::LogLine;
use crate::state::EventSink;

/// 进程结束后等待输出读完的最长时间
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    /// 命令超时
    #[error("Command timed out")]
    Timeout,
    /// 命令被取消
    #[error("Command was cancelled")]
    Cancelled,
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// 命令执行结果
#[derive(Debug)]
pub struct CommandResult {
    /// 退出状态
    pub status: ExitStatus,
    /// 是否因超时而终止
    pub timed_out: bool,
    /// 最后若干行输出
    pub tail: Vec<String>,
}

impl CommandRunner {
    /// 执行命令并流式输出日志
    ///
    /// stdout 与 stderr 在同一个任务中交替读取，保证事件顺序与读取顺序一致。
    /// 事件通道关闭时触发 `cancel` 并终止进程。
    pub async fn run_with_streaming(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        sink: &EventSink,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take().map(LineReader::new);
        let stderr = child.stderr.take().map(LineReader::new);

        let mut forward_task = tokio::spawn(forward_output(
            stdout,
            stderr,
            sink.clone(),
            cancel.clone(),
        ));

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                // 等待进程实际终止
                child.wait().await.map_err(CommandError::WaitFailed).map(|status| (status, true))
            }
            status = child.wait() => {
                status.map_err(CommandError::WaitFailed).map(|status| (status, false))
            }
        };

        // 等待日志读取完成；孙进程可能仍持有管道，最多等待 OUTPUT_DRAIN_TIMEOUT
        let tail = match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut forward_task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                warn!(program = %program, "Output still open after exit, detaching reader");
                forward_task.abort();
                Vec::new()
            }
        };

        let (status, timed_out) = result?;
        Ok(CommandResult {
            status,
            timed_out,
            tail,
        })
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于输出较短的命令（如 kubectl apply）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout)
            }
        }
    }
}

/// 按行读取进程输出，非 UTF-8 字节以替换字符解码
///
/// 未读完的行保存在 `buf` 中，在 `select!` 中被打断也不会丢数据。
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// 转发进程输出，返回最后 `LOG_TAIL_LINES` 行
///
/// 接收端关闭时（无论是否有新输出）触发 `cancel`。
async fn forward_output<O, E>(
    mut stdout: Option<LineReader<O>>,
    mut stderr: Option<LineReader<E>>,
    sink: EventSink,
    cancel: CancellationToken,
) -> Vec<String>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(LOG_TAIL_LINES);
    let mut sink_open = true;

    loop {
        let line = tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(content) => LogLine::stdout(content),
                None => { stdout = None; continue; }
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(content) => LogLine::stderr(content),
                None => { stderr = None; continue; }
            },
            _ = sink.closed(), if sink_open => {
                warn!("Event receiver closed, cancelling command");
                sink_open = false;
                cancel.cancel();
                continue;
            }
            else => break,
        };

        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.content.clone());

        // 客户端断开后继续读到 EOF，避免子进程阻塞在写管道
        if sink_open && sink.log(line).await.is_err() {
            warn!("Event receiver closed, cancelling command");
            sink_open = false;
            cancel.cancel();
        }
    }

    tail.into_iter().collect()
}

async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    let reader = reader.as_mut()?;
    match reader.next_line().await {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to read command output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::deploy::DeployEvent;
    use crate::state::event_sink;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_streaming_preserves_order() {
        let (sink, mut rx) = event_sink::channel();

        let result = CommandRunner::run_with_streaming(
            "sh",
            &["-c", "echo one; echo two; echo three"],
            &PathBuf::from("/tmp"),
            &sink,
            CancellationToken::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        drop(sink);

        assert!(result.status.success());
        assert!(!result.timed_out);
        assert_eq!(result.tail, vec!["one", "two", "three"]);

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let DeployEvent::Log(line) = event {
                lines.push(line.content);
            }
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_streaming_timeout() {
        let (sink, _rx) = event_sink::channel();

        let result = CommandRunner::run_with_streaming(
            "sh",
            &["-c", "sleep 5"],
            &PathBuf::from("/tmp"),
            &sink,
            CancellationToken::new(),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert!(result.timed_out);
        assert!(!result.status.success());
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_command() {
        let (sink, rx) = event_sink::channel();
        drop(rx);
        let cancel = CancellationToken::new();

        let result = CommandRunner::run_with_streaming(
            "sh",
            &["-c", "while true; do echo tick; sleep 0.05; done"],
            &PathBuf::from("/tmp"),
            &sink,
            cancel.clone(),
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_silent_command() {
        let (sink, rx) = event_sink::channel();
        drop(rx);
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();

        let result = CommandRunner::run_with_streaming(
            "sh",
            &["-c", "sleep 10; exit 0"],
            &PathBuf::from("/tmp"),
            &sink,
            cancel.clone(),
            Duration::from_secs(30),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Cancelled)));
        assert!(cancel.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_streaming_survives_invalid_utf8() {
        let (sink, mut rx) = event_sink::channel();

        let result = CommandRunner::run_with_streaming(
            "sh",
            &[
                "-c",
                "echo one; printf '\\377\\n'; sleep 0.2; for i in 1 2 3; do echo after$i; done; exit 0",
            ],
            &PathBuf::from("/tmp"),
            &sink,
            CancellationToken::new(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        drop(sink);

        assert!(result.status.success());
        assert_eq!(
            result.tail,
            vec!["one", "\u{FFFD}", "after1", "after2", "after3"]
        );

        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            if let DeployEvent::Log(line) = event {
                lines.push(line.content);
            }
        }
        assert_eq!(lines.len(), 5);
        assert_eq!(lines.last().map(String::as_str), Some("after3"));
    }
}

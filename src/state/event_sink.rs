//! 部署事件通道
//!
//! 每个部署请求一条有界通道：流水线写入，SSE 传输层消费。
//! 接收端被丢弃（客户端断开）后写入失败，构建阶段据此取消外部进程。

use tokio::sync::mpsc;

use crate::config::env::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::deploy::{DeployEvent, LogLine, PipelineState};

/// 接收端已关闭
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl std::fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event receiver closed")
    }
}

impl std::error::Error for SinkClosed {}

/// 事件发送端
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<DeployEvent>,
}

/// 创建事件通道
pub fn channel() -> (EventSink, mpsc::Receiver<DeployEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSink { tx }, rx)
}

impl EventSink {
    /// 发送事件，通道满时等待（背压）
    pub async fn send(&self, event: DeployEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    /// 发送日志行
    pub async fn log(&self, line: LogLine) -> Result<(), SinkClosed> {
        self.send(DeployEvent::Log(line)).await
    }

    /// 发送 stdout 日志
    pub async fn log_stdout(&self, content: impl Into<String>) -> Result<(), SinkClosed> {
        self.log(LogLine::stdout(content)).await
    }

    /// 发送阶段变更
    pub async fn stage(&self, state: PipelineState) -> Result<(), SinkClosed> {
        self.send(DeployEvent::stage(state)).await
    }

    /// 等待接收端关闭
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = channel();

        sink.stage(PipelineState::Received).await.unwrap();
        sink.log_stdout("Hello").await.unwrap();
        drop(sink);

        assert!(matches!(
            rx.recv().await,
            Some(DeployEvent::Stage { state: PipelineState::Received, .. })
        ));
        match rx.recv().await {
            Some(DeployEvent::Log(line)) => assert_eq!(line.content, "Hello"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let (sink, rx) = channel();
        drop(rx);

        sink.closed().await;
        assert_eq!(sink.log_stdout("lost").await, Err(SinkClosed));
    }
}

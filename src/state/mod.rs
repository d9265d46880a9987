//! 运行时状态模块
//!
//! 管理应用状态和部署事件通道

pub mod app_state;
pub mod event_sink;

pub use app_state::AppState;
pub use event_sink::{EventSink, SinkClosed};

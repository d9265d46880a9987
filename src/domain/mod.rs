//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum

pub mod deploy;
pub mod image;
pub mod manifest;
pub mod namespace;

// Re-exports for convenience
pub use deploy::{DeployEvent, DeployFlow, DeployOutcome, LogLine, PipelineState};
pub use image::ImageName;
pub use manifest::{DeploySection, Manifest, Resources, Scaling};
pub use namespace::Namespace;

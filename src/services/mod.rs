//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod apply;
pub mod archive;
pub mod build;
pub mod descriptor;
pub mod namespace;
pub mod pipeline;
pub mod registry;

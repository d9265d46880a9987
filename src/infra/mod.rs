//! 基础设施模块
//!
//! 封装外部依赖（命令执行、键值存储）

pub mod command;
pub mod kv;

pub use command::{CommandError, CommandResult, CommandRunner};
pub use kv::{FsKv, KvBackend, KvError, MemoryKv};

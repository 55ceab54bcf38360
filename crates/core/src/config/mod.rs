//! 配置模型与加载
//!
//! 加载顺序: 内置默认值 -> TOML 配置文件 -> `TASKMESH_` 前缀的环境变量。
//! 嵌套字段使用双下划线分隔，例如 `TASKMESH_DISPATCHER__NODE_TIMEOUT_SECONDS=10`。

pub mod models;

pub use models::*;

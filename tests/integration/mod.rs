//! 集成测试模块
//!
//! 测试各组件之间的集成和交互

mod config_reload;
#[cfg(feature = "redis")]
mod redis_test;

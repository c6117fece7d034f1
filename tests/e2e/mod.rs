//! 端到端测试模块
//!
//! 测试完整的业务流程和场景

mod abuse_escalation;
mod library_traffic;
mod store_outage;

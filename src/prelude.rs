//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Prelude module - Commonly used types for quick imports
//!
//! `use shelfguard::prelude::*;` 导入接入准入控制所需的全部常用类型。

// Core types - always available
pub use crate::config::{FailMode, RateLimitConfig};
pub use crate::coordinator::{CheckRequest, Coordinator, Verdict};
pub use crate::error::{ShelfGuardError, StorageError};
pub use crate::key::{Algorithm, Role, SubjectKey};
pub use crate::middleware::{Admission, AdmissionMiddleware};
pub use crate::tracker::RateLimitStats;

// Request context
pub use crate::matchers::RequestContext;

// Storage and time
pub use crate::clock::{Clock, SystemClock};
pub use crate::storage::{CounterStore, MemoryCounterStore};

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::redis_storage::{RedisConfig, RedisCounterStore};

#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;

//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for ShelfGuard.
//!
//! This module provides well-documented constants used throughout the library.
//! All magic numbers are defined here with their purpose and usage context.

// ============================================================================
// Store Constants
// ============================================================================

/// Default namespace prefix for every key written to the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Delimiter between key components.
///
/// Occurrences inside identities or route classes are percent-escaped.
pub const KEY_DELIMITER: char = ':';

/// Default timeout for a single counter store call (200 milliseconds).
///
/// Store calls exceeding this are treated as an outage and fail open.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 200;

/// Maximum compare-and-swap attempts for one admission check.
///
/// Contention beyond this is reported as a store failure.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 8;

/// Extra TTL added on top of every computed state horizon (1 second).
pub const TTL_MARGIN_MS: u64 = 1000;

/// Minimum TTL for a blocked marker (1 second).
pub const MIN_BLOCK_MARKER_MS: u64 = 1000;

// ============================================================================
// Policy Constants
// ============================================================================

/// Route class used when no configured pattern matches the request path.
pub const DEFAULT_FALLBACK_ROUTE: &str = "default";

/// Window of the built-in strictest policy (60 seconds).
///
/// Used only when the configured fallback route class does not exist.
pub const STRICTEST_WINDOW_MS: u64 = 60_000;

/// Request budget of the built-in strictest policy (10 requests per window).
pub const STRICTEST_MAX_REQUESTS: u64 = 10;

/// Default backoff ceiling (1 hour).
pub const DEFAULT_MAX_BACKOFF_DELAY_MS: u64 = 3_600_000;

/// Default penalty ceiling (24 hours).
///
/// Caps progressive penalties to bound denial of service against users sharing an IP.
pub const DEFAULT_MAX_PENALTY_MINUTES: u64 = 1440;

/// Default time a penalty record is remembered after it ends (24 hours).
pub const DEFAULT_PENALTY_FORGIVE_MS: u64 = 86_400_000;

/// Retry hint returned by fail-closed routes during a store outage.
pub const FAIL_CLOSED_RETRY_SECS: u64 = 1;

// ============================================================================
// Statistics Constants
// ============================================================================

/// Default number of entries in the top violators list.
pub const DEFAULT_TOP_VIOLATORS: usize = 10;

/// Default number of days of violation history kept for statistics.
pub const DEFAULT_STATS_HORIZON_DAYS: u64 = 7;

// ============================================================================
// Response Constants
// ============================================================================

/// HTTP status returned for a denied request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_ALGORITHM: &str = "X-RateLimit-Algorithm";
pub const HEADER_ROLE: &str = "X-RateLimit-Role";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

// ============================================================================
// Validation Constants
// ============================================================================

/// Maximum identity length (256 characters).
///
/// Longer user ids are rejected by the request boundary and the client IP is used instead.
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// Maximum path length (2048 characters).
pub const MAX_PATH_LENGTH: usize = 2048;

// ============================================================================
// Time Conversion Constants
// ============================================================================

/// Milliseconds per second.
pub const MS_PER_SECOND: u64 = 1000;

/// Milliseconds per minute.
pub const MS_PER_MINUTE: u64 = 60_000;

/// Milliseconds per day.
pub const MS_PER_DAY: u64 = 86_400_000;

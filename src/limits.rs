use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_AVAILABILITIES_PER_HOST: usize = 1_000;
pub const MAX_RESERVATIONS_PER_HOST: usize = 100_000;

/// Widest range an availability expansion may cover.
pub const MAX_EXPANSION_DAYS: Ms = 366;
pub const MAX_EXPANSION_WINDOW_MS: Ms = MAX_EXPANSION_DAYS * DAY_MS;

/// Longest single reservation or availability window.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_REASON_LEN: usize = 1_000;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 256;

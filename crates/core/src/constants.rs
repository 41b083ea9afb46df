/// Lifetime of a Kite Connect access token, in hours
pub const ZERODHA_TOKEN_LIFETIME_HOURS: i64 = 24;

/// Lifetime of a Breeze session token, in hours
pub const ICICI_TOKEN_LIFETIME_HOURS: i64 = 12;

/// Tokens expiring within this window are refreshed by the sweep
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 60 * 60;

/// Default freshness window of a cached portfolio snapshot
pub const DEFAULT_PORTFOLIO_CACHE_TTL_SECS: u64 = 15 * 60;

/// Key prefix of cached broker tokens
pub const TOKEN_CACHE_PREFIX: &str = "token";

/// Key prefix of cached portfolio snapshots
pub const PORTFOLIO_CACHE_PREFIX: &str = "portfolio";

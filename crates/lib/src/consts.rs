/// Application name, used for default directory names.
pub const APP_NAME: &str = "strata";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "STRATA_CACHE_DIR";

/// Marker file written last into a cache entry; an entry without it is incomplete.
pub const COMPLETE_MARKER: &str = ".strata-complete";

/// Current cache marker format version.
pub const MARKER_VERSION: u32 = 2;

/// File name of the persisted step cost history inside the cache root.
pub const COST_HISTORY_FILE: &str = "cost-history.json";

/// Number of fingerprint characters shown in human-readable output.
pub const SHORT_FINGERPRINT_LEN: usize = 12;

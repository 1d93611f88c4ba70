//! Constants for the download module (timeouts, sampling, filename limits).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default timeout for primary URL resolution calls (short, JSON only).
pub const RESOLVE_TIMEOUT_SECS: u64 = 15;

/// Default timeout for a whole bulk transfer (1 hour).
pub const TRANSFER_TIMEOUT_SECS: u64 = 3600;

/// Minimum spacing between progress samples.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Maximum characters kept in a derived filename base (before the extension).
pub const MAX_FILENAME_BASE_CHARS: usize = 200;

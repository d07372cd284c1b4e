use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default origin manifests and bundles are fetched from.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5173";

/// The default path of the runtime package manifest, relative to the base URL.
pub const DEFAULT_MANIFEST_PATH: &str = "/runtime-packages/index.json";

/// The first port handed out to applications.
pub const DEFAULT_APP_PORT_BASE: u16 = 8080;

/// The number of progress increments of the staged boot sequence.
pub const DEFAULT_BOOT_STEPS: u8 = 4;

/// The delay between boot progress increments.
pub const DEFAULT_BOOT_STEP_DELAY: Duration = Duration::from_millis(250);

/// The delay of a wake from hibernation.
pub const DEFAULT_WAKE_DELAY: Duration = Duration::from_millis(200);

/// The number of finished runtime operations kept in memory.
pub const DEFAULT_OPERATION_HISTORY_LIMIT: usize = 50;

/// The ceiling on concurrently tracked operations.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 10;

/// The time a single attempt may take.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// The age after which a tracked operation's bookkeeping is evicted.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(300);

/// The interval of the background maintenance sweep.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// The maximum number of attempts of a retried operation.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// The delay before the first retry.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

/// The growth factor of the retry delay.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// The cap on the retry delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// The maximum random jitter added to a retry delay, as a fraction of the delay.
pub const DEFAULT_RETRY_JITTER: f64 = 0.3;

/// The number of failures within the monitoring window that opens a breaker.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker rejects calls before admitting a trial.
pub const DEFAULT_BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// The window failures are counted in.
pub const DEFAULT_BREAKER_MONITORING_WINDOW: Duration = Duration::from_secs(300);

/// How long a closed breaker must be quiet before its counters are zeroed.
pub const DEFAULT_BREAKER_IDLE_RESET: Duration = Duration::from_secs(600);

//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Aggregator configuration.
///
/// Built once at startup and cloned into every component; nothing reads
/// settings from global state.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Worker pool size (mailboxes polled concurrently).
    pub max_tasks_at_once: usize,
    /// Maximum number of mailboxes loaded into the ready queue at once.
    pub max_items_limit: usize,
    /// Ready queue is discarded and reloaded once it is this old.
    pub queue_lifetime: Duration,
    /// How long a tenant admission decision stays cached.
    pub tenant_caching_period: Duration,
    /// Next-attempt push for mailboxes of overdue (or unknown) tenants.
    pub overdue_account_delay: Duration,
    /// Next-attempt push for mailboxes of tenants out of storage quota.
    pub quota_ended_delay: Duration,
    /// Locks older than this are reclaimed by the watchdog.
    pub watchdog_timeout: Duration,
    /// Watchdog tick interval.
    pub watchdog_interval: Duration,
    /// Enable the crash-recovery journal.
    pub use_dump: bool,
    /// Journal file location.
    pub dump_path: PathBuf,
    /// Mailbox store location.
    pub store_path: PathBuf,
    /// Retry interval when nothing is running and nothing could be acquired.
    pub check_interval: Duration,
    /// Maximum wait for a task completion before recomputing the shortfall.
    pub check_timeout: Duration,
    /// Upper bound the protocol clients apply to a single poll.
    pub tcp_timeout: Duration,
    /// How long in-flight polls may finish after cancellation.
    pub shutdown_grace: Duration,
    /// Minimum spacing between checks of a mailbox whose user is active.
    pub active_interval: Duration,
    /// Minimum spacing between checks of an inactive mailbox. Also the
    /// window within which a user check marks a mailbox as active.
    pub inactive_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_tasks_at_once: 10,
            max_items_limit: 100,
            queue_lifetime: Duration::from_secs(600), // 10 minutes
            tenant_caching_period: Duration::from_secs(300), // 5 minutes
            overdue_account_delay: Duration::from_secs(600),
            quota_ended_delay: Duration::from_secs(600),
            watchdog_timeout: Duration::from_secs(15 * 60),
            watchdog_interval: Duration::from_secs(60),
            use_dump: true,
            dump_path: PathBuf::from("./data/aggregator-dump.db"),
            store_path: PathBuf::from("./data/aggregator.db"),
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(30),
            tcp_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            active_interval: Duration::from_secs(60),
            inactive_interval: Duration::from_secs(600),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from `AGGREGATOR_*` environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let usize_var = |key: &str, default: usize| -> usize {
            parse_or(&lookup, key, default)
        };
        let secs_var = |key: &str, default: Duration| -> Duration {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs()))
        };
        let mins_var = |key: &str, default: Duration| -> Duration {
            Duration::from_secs(parse_or(&lookup, key, default.as_secs() / 60) * 60)
        };

        Self {
            max_tasks_at_once: usize_var("AGGREGATOR_MAX_TASKS_AT_ONCE", defaults.max_tasks_at_once),
            max_items_limit: usize_var("AGGREGATOR_MAX_ITEMS_LIMIT", defaults.max_items_limit),
            queue_lifetime: secs_var("AGGREGATOR_QUEUE_LIFETIME_SECS", defaults.queue_lifetime),
            tenant_caching_period: secs_var(
                "AGGREGATOR_TENANT_CACHING_PERIOD_SECS",
                defaults.tenant_caching_period,
            ),
            overdue_account_delay: secs_var(
                "AGGREGATOR_OVERDUE_ACCOUNT_DELAY_SECS",
                defaults.overdue_account_delay,
            ),
            quota_ended_delay: secs_var(
                "AGGREGATOR_QUOTA_ENDED_DELAY_SECS",
                defaults.quota_ended_delay,
            ),
            watchdog_timeout: mins_var(
                "AGGREGATOR_WATCHDOG_TIMEOUT_MINUTES",
                defaults.watchdog_timeout,
            ),
            watchdog_interval: mins_var(
                "AGGREGATOR_WATCHDOG_INTERVAL_MINUTES",
                defaults.watchdog_interval,
            ),
            use_dump: parse_or(&lookup, "AGGREGATOR_USE_DUMP", defaults.use_dump),
            dump_path: lookup("AGGREGATOR_DUMP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.dump_path),
            store_path: lookup("AGGREGATOR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            check_interval: secs_var("AGGREGATOR_CHECK_INTERVAL_SECS", defaults.check_interval),
            check_timeout: secs_var("AGGREGATOR_CHECK_TIMEOUT_SECS", defaults.check_timeout),
            tcp_timeout: secs_var("AGGREGATOR_TCP_TIMEOUT_SECS", defaults.tcp_timeout),
            shutdown_grace: secs_var("AGGREGATOR_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            active_interval: secs_var("AGGREGATOR_ACTIVE_INTERVAL_SECS", defaults.active_interval),
            inactive_interval: secs_var(
                "AGGREGATOR_INACTIVE_INTERVAL_SECS",
                defaults.inactive_interval,
            ),
        }
    }

    /// Reject settings the scheduling loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks_at_once == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_tasks_at_once".to_string(),
                message: "worker pool needs at least one slot".to_string(),
            });
        }
        if self.max_items_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_items_limit".to_string(),
                message: "queue load limit must be positive".to_string(),
            });
        }
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "watchdog_interval".to_string(),
                message: "watchdog interval must be positive".to_string(),
            });
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "check_interval".to_string(),
                message: "idle retry interval must be positive".to_string(),
            });
        }
        // A live poll must never outlast its lock.
        if self.watchdog_timeout <= self.tcp_timeout {
            return Err(ConfigError::InvalidValue {
                key: "watchdog_timeout".to_string(),
                message: format!(
                    "must exceed tcp_timeout ({}s)",
                    self.tcp_timeout.as_secs()
                ),
            });
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring malformed configuration value");
                default
            }
        },
        None => default,
    }
}

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GuardError, Result};

/// Limits enforced by [`AbuseGuard`](crate::rate_limiter::AbuseGuard).
#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    pub command_cooldown: Duration,
    pub spam_threshold: u32,
    pub spam_window: Duration,
    pub block_duration: Duration,
    /// Entries older than this are dropped by `cleanup()`.
    pub cleanup_staleness: Duration,
    /// Legacy ring size for the per-user request log. `None` keeps every
    /// request from the last hour. With `Some(10)` neither the
    /// per-minute nor the hourly limit can ever be reached.
    pub request_log_cap: Option<usize>,
    /// Users that are never limited (the bot admin).
    pub exempt_users: HashSet<u64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 20,
            requests_per_hour: 100,
            command_cooldown: Duration::from_secs(2),
            spam_threshold: 5,
            spam_window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
            cleanup_staleness: Duration::from_secs(3600),
            request_log_cap: None,
            exempt_users: HashSet::new(),
        }
    }
}

/// When the host sweeps stale guard state.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// Period of the background sweeper. `None` disables it and the host
    /// falls back to probabilistic sweeps.
    pub interval: Option<Duration>,
    pub first_run: Duration,
    /// Chance that a gated request triggers a sweep when no sweeper runs.
    pub probability: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(1800)),
            first_run: Duration::from_secs(300),
            probability: 0.01,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub guard: GuardConfig,
    pub sweep: SweepConfig,
}

impl Settings {
    /// Read settings from the process environment. Call `dotenv().ok()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Build settings from key/value pairs, starting from the defaults.
    /// Unknown keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Settings::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            let guard = &mut settings.guard;
            let sweep = &mut settings.sweep;
            match key {
                "ADMIN_USER_ID" => {
                    let id: u64 = parse(key, value)?;
                    if id != 0 {
                        guard.exempt_users.insert(id);
                    }
                }
                "ANTISPAM_REQUESTS_PER_MINUTE" => guard.requests_per_minute = parse(key, value)?,
                "ANTISPAM_REQUESTS_PER_HOUR" => guard.requests_per_hour = parse(key, value)?,
                "ANTISPAM_COMMAND_COOLDOWN_SECS" => guard.command_cooldown = secs(key, value)?,
                "ANTISPAM_SPAM_THRESHOLD" => guard.spam_threshold = parse(key, value)?,
                "ANTISPAM_SPAM_WINDOW_SECS" => guard.spam_window = secs(key, value)?,
                "ANTISPAM_BLOCK_DURATION_SECS" => guard.block_duration = secs(key, value)?,
                "ANTISPAM_CLEANUP_STALENESS_SECS" => guard.cleanup_staleness = secs(key, value)?,
                "ANTISPAM_REQUEST_LOG_CAP" => {
                    let cap: usize = parse(key, value)?;
                    guard.request_log_cap = (cap != 0).then_some(cap);
                }
                "ANTISPAM_CLEANUP_INTERVAL_SECS" => {
                    let interval = secs(key, value)?;
                    sweep.interval = (!interval.is_zero()).then_some(interval);
                }
                "ANTISPAM_CLEANUP_FIRST_RUN_SECS" => sweep.first_run = secs(key, value)?,
                "ANTISPAM_SWEEP_PROBABILITY" => {
                    let p: f64 = parse(key, value)?;
                    if !(0.0..=1.0).contains(&p) {
                        return Err(invalid(key, value));
                    }
                    sweep.probability = p;
                }
                _ => {}
            }
        }
        Ok(settings)
    }
}

/// Longest duration any setting may hold (one year).
const MAX_SETTING_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

fn invalid(key: &str, value: &str) -> GuardError {
    GuardError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(key, value))
}

fn secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse(key, value)?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| *d <= MAX_SETTING_DURATION)
        .ok_or_else(|| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let settings = Settings::from_vars(Vec::<(String, String)>::new()).unwrap();
        let guard = &settings.guard;
        assert_eq!(guard.requests_per_minute, 20);
        assert_eq!(guard.requests_per_hour, 100);
        assert_eq!(guard.command_cooldown, Duration::from_secs(2));
        assert_eq!(guard.spam_threshold, 5);
        assert_eq!(guard.block_duration, Duration::from_secs(300));
        assert_eq!(guard.cleanup_staleness, Duration::from_secs(3600));
        assert_eq!(guard.request_log_cap, None);
        assert!(guard.exempt_users.is_empty());
        assert_eq!(settings.sweep.interval, Some(Duration::from_secs(1800)));
        assert_eq!(settings.sweep.first_run, Duration::from_secs(300));
    }

    #[test]
    fn overrides_are_applied() {
        let settings = Settings::from_vars([
            ("ADMIN_USER_ID", "42"),
            ("ANTISPAM_REQUESTS_PER_MINUTE", "5"),
            ("ANTISPAM_COMMAND_COOLDOWN_SECS", "0.5"),
            ("ANTISPAM_REQUEST_LOG_CAP", "10"),
            ("ANTISPAM_CLEANUP_INTERVAL_SECS", "0"),
            ("ANTISPAM_SWEEP_PROBABILITY", "0.25"),
            ("PATH", "/usr/bin"),
        ])
        .unwrap();
        assert!(settings.guard.exempt_users.contains(&42));
        assert_eq!(settings.guard.requests_per_minute, 5);
        assert_eq!(settings.guard.command_cooldown, Duration::from_millis(500));
        assert_eq!(settings.guard.request_log_cap, Some(10));
        assert_eq!(settings.sweep.interval, None);
        assert_eq!(settings.sweep.probability, 0.25);
    }

    #[test]
    fn zero_admin_id_means_no_exemption() {
        let settings = Settings::from_vars([("ADMIN_USER_ID", "0")]).unwrap();
        assert!(settings.guard.exempt_users.is_empty());
    }

    #[test]
    fn year_long_durations_are_accepted() {
        let settings = Settings::from_vars([("ANTISPAM_BLOCK_DURATION_SECS", "31536000")]).unwrap();
        assert_eq!(settings.guard.block_duration, MAX_SETTING_DURATION);
    }

    #[test]
    fn bad_values_are_rejected() {
        for (key, value) in [
            ("ANTISPAM_SPAM_THRESHOLD", "lots"),
            ("ANTISPAM_BLOCK_DURATION_SECS", "-1"),
            ("ANTISPAM_BLOCK_DURATION_SECS", "1.8e19"),
            ("ANTISPAM_CLEANUP_FIRST_RUN_SECS", "4e7"),
            ("ANTISPAM_SWEEP_PROBABILITY", "1.5"),
            ("ADMIN_USER_ID", "admin"),
        ] {
            match Settings::from_vars([(key, value)]) {
                Err(GuardError::InvalidSetting { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{key}={value} should be rejected, got {other:?}"),
            }
        }
    }
}

//! In-process abuse control: per-user request limits, per-command cooldowns,
//! repeat-command spam detection and temporary blocks.
//!
//! All bookkeeping sits behind one mutex, so every [`AbuseGuard::check`] is
//! atomic with respect to other checks and to [`AbuseGuard::cleanup`].
//! Expiry is lazy: nothing happens when a block or window runs out until the
//! next check or sweep looks at it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
/// Upper bound on a block when `block_duration` would overflow `Instant`.
const LONGEST_BLOCK: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    /// The user is serving a block installed earlier.
    Blocked { remaining: Duration },
    MinuteLimit { block: Duration },
    HourLimit { block: Duration },
    /// The same command was used again too soon. No block is installed.
    Cooldown { remaining: Duration },
    CommandSpam { command: String, block: Duration },
}

impl DenyReason {
    /// Whether this denial installed a new block.
    pub fn trips_block(&self) -> bool {
        matches!(
            self,
            DenyReason::MinuteLimit { .. }
                | DenyReason::HourLimit { .. }
                | DenyReason::CommandSpam { .. }
        )
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Blocked { remaining } => {
                write!(f, "blocked, {} seconds remaining", ceil_secs(*remaining))
            }
            DenyReason::MinuteLimit { block } => write!(
                f,
                "per-minute limit exceeded, blocked for {} seconds",
                block.as_secs()
            ),
            DenyReason::HourLimit { block } => write!(
                f,
                "per-hour limit exceeded, blocked for {} seconds",
                block.as_secs()
            ),
            DenyReason::Cooldown { remaining } => write!(
                f,
                "cooldown active, wait {:.1} seconds",
                remaining.as_secs_f64()
            ),
            DenyReason::CommandSpam { command, block } => write!(
                f,
                "command spam detected ({}), blocked for {} seconds",
                command,
                block.as_secs()
            ),
        }
    }
}

/// Whole seconds, rounded up.
pub fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Outcome of [`AbuseGuard::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Human-readable reason; empty when allowed.
    pub fn reason(&self) -> String {
        match self {
            Decision::Allow => String::new(),
            Decision::Deny(reason) => reason.to_string(),
        }
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Decision::Allow => None,
            Decision::Deny(reason) => Some(reason),
        }
    }
}

/// Number of entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub blocks: usize,
    pub cooldowns: usize,
    pub spam_counters: usize,
    pub request_entries: usize,
    pub idle_users: usize,
}

impl CleanupStats {
    pub fn total(&self) -> usize {
        self.blocks + self.cooldowns + self.spam_counters + self.request_entries + self.idle_users
    }
}

/// Current sizes of the tracked structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    pub tracked_users: usize,
    pub blocked_users: usize,
    pub cooldowns: usize,
    pub spam_counters: usize,
}

#[derive(Debug, Clone, Copy)]
struct SpamCounter {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Default)]
struct GuardState {
    requests: HashMap<u64, VecDeque<Instant>>,
    blocked: HashMap<u64, Instant>,
    cooldowns: HashMap<(u64, String), Instant>,
    spam: HashMap<u64, HashMap<String, SpamCounter>>,
}

impl GuardState {
    fn check_rate_limit(&mut self, cfg: &GuardConfig, user_id: u64, now: Instant) -> Option<DenyReason> {
        if let Some(&until) = self.blocked.get(&user_id) {
            if now < until {
                return Some(DenyReason::Blocked {
                    remaining: until - now,
                });
            }
            self.blocked.remove(&user_id);
        }

        let log = self.requests.entry(user_id).or_default();
        log.push_back(now);
        while log.front().is_some_and(|&t| now.duration_since(t) >= HOUR) {
            log.pop_front();
        }
        if let Some(cap) = cfg.request_log_cap {
            while log.len() > cap {
                log.pop_front();
            }
        }

        let last_minute = log.iter().filter(|&&t| now.duration_since(t) < MINUTE).count();
        if last_minute > cfg.requests_per_minute {
            return Some(self.block(cfg, user_id, now, DenyReason::MinuteLimit {
                block: cfg.block_duration,
            }));
        }

        // The log only holds the last hour.
        if log.len() > cfg.requests_per_hour {
            return Some(self.block(cfg, user_id, now, DenyReason::HourLimit {
                block: cfg.block_duration,
            }));
        }

        None
    }

    fn check_command_spam(
        &mut self,
        cfg: &GuardConfig,
        user_id: u64,
        command: &str,
        now: Instant,
    ) -> Option<DenyReason> {
        let key = (user_id, command.to_string());
        if let Some(&last) = self.cooldowns.get(&key) {
            let since = now.duration_since(last);
            if since < cfg.command_cooldown {
                return Some(DenyReason::Cooldown {
                    remaining: cfg.command_cooldown - since,
                });
            }
        }
        self.cooldowns.insert(key, now);

        let counter = self
            .spam
            .entry(user_id)
            .or_default()
            .entry(command.to_string())
            .or_insert(SpamCounter {
                count: 0,
                window_start: now,
            });
        if now.duration_since(counter.window_start) > cfg.spam_window {
            counter.count = 1;
            counter.window_start = now;
        } else {
            counter.count += 1;
        }

        if counter.count > cfg.spam_threshold {
            return Some(self.block(cfg, user_id, now, DenyReason::CommandSpam {
                command: command.to_string(),
                block: cfg.block_duration,
            }));
        }

        None
    }

    fn block(&mut self, cfg: &GuardConfig, user_id: u64, now: Instant, reason: DenyReason) -> DenyReason {
        let until = now
            .checked_add(cfg.block_duration)
            .or_else(|| now.checked_add(LONGEST_BLOCK))
            .unwrap_or(now);
        self.blocked.insert(user_id, until);
        log::warn!(
            "User {} blocked for {}s. Reason: {}",
            user_id,
            cfg.block_duration.as_secs(),
            reason
        );
        reason
    }

    fn sweep(&mut self, cfg: &GuardConfig, now: Instant) -> CleanupStats {
        let mut stats = CleanupStats::default();
        // A counter or cooldown is never older than the staleness while its
        // own window is still open.
        let cooldown_horizon = cfg.cleanup_staleness.max(cfg.command_cooldown);
        let spam_horizon = cfg.cleanup_staleness.max(cfg.spam_window);

        let before = self.blocked.len();
        self.blocked.retain(|_, until| now < *until);
        stats.blocks = before - self.blocked.len();

        let before = self.cooldowns.len();
        self.cooldowns
            .retain(|_, last| now.duration_since(*last) <= cooldown_horizon);
        stats.cooldowns = before - self.cooldowns.len();

        for counters in self.spam.values_mut() {
            let before = counters.len();
            counters.retain(|_, counter| now.duration_since(counter.window_start) <= spam_horizon);
            stats.spam_counters += before - counters.len();
        }
        self.spam.retain(|_, counters| !counters.is_empty());

        // Never trim inside the hourly lookback, whatever the staleness.
        let horizon = cfg.cleanup_staleness.max(HOUR);
        for log in self.requests.values_mut() {
            while log.front().is_some_and(|&t| now.duration_since(t) >= horizon) {
                log.pop_front();
                stats.request_entries += 1;
            }
        }
        let before = self.requests.len();
        self.requests.retain(|_, log| !log.is_empty());
        stats.idle_users = before - self.requests.len();

        stats
    }
}

/// Shared abuse-control state for the bot. Wrap in an `Arc` and hand a clone
/// to every handler.
pub struct AbuseGuard {
    state: Mutex<GuardState>,
    config: GuardConfig,
    clock: Arc<dyn Clock>,
}

impl AbuseGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    // Decisions must keep flowing even if some thread panicked mid-update.
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether `user_id` may run `command` now, recording the attempt.
    ///
    /// The request limits run first; the cooldown and spam checks are only
    /// reached when they pass. Every attempt that gets past an existing block
    /// is recorded, whatever the outcome.
    pub fn check(&self, user_id: u64, command: &str) -> Decision {
        if self.config.exempt_users.contains(&user_id) {
            return Decision::Allow;
        }

        let mut state = self.lock();
        let now = self.clock.now();
        let denial = state
            .check_rate_limit(&self.config, user_id, now)
            .or_else(|| state.check_command_spam(&self.config, user_id, command, now));

        match denial {
            Some(reason) => {
                log::debug!("Denied user {} command {}: {}", user_id, command, reason);
                Decision::Deny(reason)
            }
            None => {
                log::debug!("Allowed user {} command {}", user_id, command);
                Decision::Allow
            }
        }
    }

    /// Remove expired blocks and anything older than the staleness threshold.
    ///
    /// Fails only when the state lock was poisoned by a panicking holder. The
    /// poison flag is cleared so the next sweep can run.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                self.state.clear_poison();
                return Err(GuardError::Poisoned);
            }
        };
        let now = self.clock.now();
        Ok(state.sweep(&self.config, now))
    }

    pub fn is_blocked(&self, user_id: u64) -> bool {
        !self.block_time_left(user_id).is_zero()
    }

    /// Time until the user's block lifts; zero when not blocked.
    pub fn block_time_left(&self, user_id: u64) -> Duration {
        let state = self.lock();
        let now = self.clock.now();
        state
            .blocked
            .get(&user_id)
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn stats(&self) -> GuardStats {
        let state = self.lock();
        GuardStats {
            tracked_users: state.requests.len(),
            blocked_users: state.blocked.len(),
            cooldowns: state.cooldowns.len(),
            spam_counters: state.spam.values().map(HashMap::len).sum(),
        }
    }
}

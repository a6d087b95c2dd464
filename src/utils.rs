use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use teloxide::errors::RequestError;
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use teloxide::Bot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::SweepConfig;
use crate::rate_limiter::{ceil_secs, AbuseGuard, CleanupStats, Decision, DenyReason};

/// The admin is whoever the guard exempts.
pub fn is_admin(guard: &AbuseGuard, user_id: u64) -> bool {
    guard.config().exempt_users.contains(&user_id)
}

pub fn warning_text(reason: &DenyReason) -> String {
    format!(
        "Anti-spam protection\n\n{}\n\nPlease use the bot at a moderate pace:\n\
         - don't send commands too often\n\
         - don't repeat the same command\n\
         - wait between requests\n\n\
         Blocks lift automatically.",
        reason
    )
}

/// `/status` answer for another user, rounded the same way as denials.
pub fn block_status_text(user_id: u64, left: Duration) -> String {
    if left.is_zero() {
        format!("User {} is not blocked.", user_id)
    } else {
        format!("User {} is blocked for {} more seconds.", user_id, ceil_secs(left))
    }
}

pub async fn send_warning(bot: &Bot, chat_id: ChatId, reason: &DenyReason) -> Result<(), RequestError> {
    bot.send_message(chat_id, warning_text(reason)).await?;
    Ok(())
}

/// Run one sweep. Failures are logged and swallowed so a bad sweep never
/// takes the bot down.
pub fn run_sweep(guard: &AbuseGuard) -> Option<CleanupStats> {
    match guard.cleanup() {
        Ok(removed) => {
            let stats = guard.stats();
            log::info!(
                "Antispam cleanup completed: removed {} entries ({} blocks, {} cooldowns, {} spam counters, {} requests, {} idle users); tracking {} users, {} blocked",
                removed.total(),
                removed.blocks,
                removed.cooldowns,
                removed.spam_counters,
                removed.request_entries,
                removed.idle_users,
                stats.tracked_users,
                stats.blocked_users
            );
            Some(removed)
        }
        Err(e) => {
            log::error!("Error during antispam cleanup: {}", e);
            None
        }
    }
}

/// Sweep with the given probability. Returns whether a sweep ran.
pub fn maybe_sweep(guard: &AbuseGuard, probability: f64) -> bool {
    if probability > 0.0 && rand::thread_rng().gen_bool(probability.min(1.0)) {
        run_sweep(guard);
        true
    } else {
        false
    }
}

/// Check a user action, sweeping opportunistically when no background
/// sweeper is configured.
pub fn gate(guard: &AbuseGuard, sweep: &SweepConfig, user_id: u64, command: &str) -> Decision {
    if sweep.interval.is_none() && !is_admin(guard, user_id) {
        maybe_sweep(guard, sweep.probability);
    }

    let decision = guard.check(user_id, command);
    match &decision {
        Decision::Deny(reason) if reason.trips_block() => {
            log::warn!("Antispam blocked user {} for command {}: {}", user_id, command, reason)
        }
        Decision::Deny(reason) => {
            log::info!("Antispam refused user {} for command {}: {}", user_id, command, reason)
        }
        Decision::Allow => {}
    }
    decision
}

/// Start the periodic sweeper. Returns `None` when sweeping is left to
/// [`maybe_sweep`].
pub fn spawn_sweeper(guard: Arc<AbuseGuard>, sweep: &SweepConfig) -> Option<JoinHandle<()>> {
    let period = sweep.interval.filter(|p| !p.is_zero())?;
    let first_run = sweep.first_run;

    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let mut ticks = interval_at(start.checked_add(first_run).unwrap_or(start), period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            run_sweep(&guard);
        }
    });
    log::info!(
        "Antispam cleanup job scheduled (every {}s, first after {}s)",
        period.as_secs(),
        first_run.as_secs()
    );
    Some(handle)
}

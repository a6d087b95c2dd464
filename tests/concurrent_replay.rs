use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use archive_bot::clock::ManualClock;
use archive_bot::rate_limiter::{AbuseGuard, Decision, DenyReason};
use archive_bot::GuardConfig;

const USERS: u64 = 1000;
const WORKERS: u64 = 8;
const REQUESTS_PER_USER: usize = 24;

// Mixes repeated commands (cooldown hits) with distinct buttons so that some
// users trip the per-minute limit and get blocked part-way through.
fn script(user_id: u64) -> Vec<String> {
    (0..REQUESTS_PER_USER)
        .map(|i| match (user_id + i as u64) % 4 {
            0 => "start".to_string(),
            1 => "upload_file".to_string(),
            _ => format!("button_{i}"),
        })
        .collect()
}

fn run_user(guard: &AbuseGuard, user_id: u64) -> Vec<Decision> {
    script(user_id)
        .iter()
        .map(|command| guard.check(user_id, command))
        .collect()
}

#[test]
fn concurrent_checks_match_sequential_replay() {
    let clock = Arc::new(ManualClock::new());
    let concurrent = Arc::new(AbuseGuard::with_clock(GuardConfig::default(), clock.clone()));
    let barrier = Arc::new(Barrier::new(WORKERS as usize + 1));

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let guard = Arc::clone(&concurrent);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (worker..USERS)
                    .step_by(WORKERS as usize)
                    .map(|user_id| (user_id, run_user(&guard, user_id)))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let sweeper = {
        let guard = Arc::clone(&concurrent);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..50 {
                guard.cleanup().expect("sweep during checks");
            }
        })
    };

    let mut observed: Vec<(u64, Vec<Decision>)> = workers
        .into_iter()
        .flat_map(|w| w.join().expect("worker panicked"))
        .collect();
    sweeper.join().expect("sweeper panicked");
    observed.sort_by_key(|(user_id, _)| *user_id);
    assert_eq!(observed.len(), USERS as usize);

    let sequential = AbuseGuard::with_clock(GuardConfig::default(), clock);
    for (user_id, decisions) in &observed {
        assert_eq!(decisions, &run_user(&sequential, *user_id), "user {user_id}");
    }

    let stats = concurrent.stats();
    assert_eq!(stats, sequential.stats());
    assert_eq!(stats.tracked_users, USERS as usize);
    assert!(stats.blocked_users > 0);
}

#[test]
fn every_user_gets_a_block_once_over_the_minute_limit() {
    let clock = Arc::new(ManualClock::new());
    let guard = Arc::new(AbuseGuard::with_clock(GuardConfig::default(), clock.clone()));

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let guard = Arc::clone(&guard);
            thread::spawn(move || {
                for user_id in (worker..USERS).step_by(WORKERS as usize) {
                    for i in 0..21 {
                        guard.check(user_id, &format!("button_{i}"));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(guard.stats().blocked_users, USERS as usize);
    clock.advance(Duration::from_secs(1));
    for user_id in 0..USERS {
        match guard.check(user_id, "start") {
            Decision::Deny(DenyReason::Blocked { remaining }) => {
                assert_eq!(remaining, Duration::from_secs(299));
            }
            other => panic!("user {user_id} not blocked: {other:?}"),
        }
    }
}

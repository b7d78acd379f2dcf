//! Stress tests for the cancel–fire race and at-most-once execution.
//!
//! Worth running under a race detector (`cargo test` with
//! `RUSTFLAGS="-Zsanitizer=thread"` on nightly): the callbacks touch the
//! shared state with no synchronization beyond the client lock the daemon
//! holds for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use timeoutd::{monotonic_now, Daemon, Timeout};

/// Seeded xorshift so stress runs are reproducible.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn wait_for(condition: impl Fn() -> bool, limit: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[derive(Default)]
struct CoinFlipState {
    fired: Vec<bool>,
    cancel_won: Vec<bool>,
    fired_total: usize,
}

/// For each trial, schedule a timeout a hair in the future, then under the
/// client lock flip a coin and either cancel or let it run. Exactly the
/// trials whose cancel won (observed the callback not yet fired, under the
/// lock) must never fire; everything else fires exactly once.
#[test]
fn coin_flip_cancel_accounting() {
    const TRIALS: usize = 10_000;

    let conn = Arc::new(Mutex::new(CoinFlipState {
        fired: vec![false; TRIALS],
        cancel_won: vec![false; TRIALS],
        fired_total: 0,
    }));
    let daemon = Daemon::new(Arc::clone(&conn));
    let mut rng = XorShift::new(0x9E37_79B9_7F4A_7C15);
    let mut wins = 0usize;

    for i in 0..TRIALS {
        let handle = daemon
            .add_timeout(
                move |state: &mut CoinFlipState| {
                    assert!(!state.cancel_won[i], "callback ran after a winning cancel");
                    assert!(!state.fired[i], "callback ran twice");
                    state.fired[i] = true;
                    state.fired_total += 1;
                },
                monotonic_now() + Duration::from_micros(1),
            )
            .unwrap();

        if rng.next() % 2 == 0 {
            let mut state = conn.lock().unwrap();
            if !state.fired[i] {
                handle.cancel();
                state.cancel_won[i] = true;
                wins += 1;
            }
        }
    }

    assert!(wait_for(
        || conn.lock().unwrap().fired_total == TRIALS - wins,
        Duration::from_secs(10)
    ));
    // Settle, then confirm the count does not move past the target.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(conn.lock().unwrap().fired_total, TRIALS - wins);
}

#[derive(Default)]
struct EntryState {
    calls: u32,
    cancelled: bool,
    handle: Option<Arc<Timeout>>,
}

#[derive(Default)]
struct RaceState {
    entries: HashMap<u64, EntryState>,
}

/// Several threads concurrently schedule timeouts and occasionally cancel
/// a random live one. Every callback asserts it is neither a duplicate nor
/// cancelled; afterwards every uncancelled entry must have fired once.
#[test]
fn randomized_add_and_cancel_is_at_most_once() {
    const THREADS: u64 = 4;
    const ITERATIONS: u64 = 2_000;

    let conn = Arc::new(Mutex::new(RaceState::default()));
    let daemon = Arc::new(Daemon::new(Arc::clone(&conn)));

    let mut workers = Vec::new();
    for t in 0..THREADS {
        let conn = Arc::clone(&conn);
        let daemon = Arc::clone(&daemon);
        workers.push(thread::spawn(move || {
            let mut rng = XorShift::new(0xDEAD_BEEF ^ (t + 1));
            for k in 0..ITERATIONS {
                if rng.next() % 100 == 0 {
                    // Cancel one live, unfired timeout, if any.
                    let mut state = conn.lock().unwrap();
                    if let Some((_, entry)) = state
                        .entries
                        .iter_mut()
                        .find(|(_, e)| e.handle.is_some() && !e.cancelled && e.calls == 0)
                    {
                        entry.cancelled = true;
                        entry.handle.as_ref().unwrap().cancel();
                    }
                } else {
                    let id = (t << 32) | k;
                    conn.lock()
                        .unwrap()
                        .entries
                        .insert(id, EntryState::default());
                    let handle = daemon
                        .add_timeout(
                            move |state: &mut RaceState| {
                                let entry = state
                                    .entries
                                    .get_mut(&id)
                                    .expect("entry registered before scheduling");
                                assert!(
                                    !entry.cancelled,
                                    "cancelled timeout callback called"
                                );
                                entry.calls += 1;
                                assert!(
                                    entry.calls == 1,
                                    "timeout callback called more than once"
                                );
                            },
                            monotonic_now() + Duration::from_millis(10),
                        )
                        .unwrap();
                    conn.lock().unwrap().entries.get_mut(&id).unwrap().handle = Some(handle);
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(wait_for(
        || {
            let state = conn.lock().unwrap();
            state.entries.values().all(|e| e.cancelled || e.calls == 1)
        },
        Duration::from_secs(10)
    ));
    daemon.stop();
}

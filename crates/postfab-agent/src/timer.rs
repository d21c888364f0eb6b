//! Shared idle timer.
//!
//! The agent exits after a period of inactivity, but an instruction that is
//! mid-execution must never be cut off by the timer firing underneath it.
//! Holding a [`BlockGuard`] suspends expiration; if the underlying clock
//! runs out while blocked, expiry is deferred and the timer is re-armed for
//! a fresh full period once the last guard is released, so there is no
//! instant fire after a long-running instruction.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

#[derive(Clone)]
pub struct SharedTimer {
    inner: Arc<Inner>,
}

struct Inner {
    timeout: Duration,
    state: Mutex<TimerState>,
    rearm: Notify,
    fired: watch::Sender<bool>,
}

struct TimerState {
    block_count: u32,
    expired: bool,
    deadline: Instant,
}

/// Suspends timer expiration while alive. Dropping the last guard re-arms
/// the timer for a fresh full period.
pub struct BlockGuard {
    timer: SharedTimer,
}

impl SharedTimer {
    pub fn new(timeout: Duration) -> Self {
        let (fired, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            timeout,
            state: Mutex::new(TimerState {
                block_count: 0,
                expired: false,
                deadline: Instant::now() + timeout,
            }),
            rearm: Notify::new(),
            fired,
        });
        tokio::spawn(run(Arc::clone(&inner)));
        Self { inner }
    }

    /// Suspend expiration for the lifetime of the returned guard. Guards
    /// nest. After the timer has fired this is a no-op.
    pub fn block(&self) -> BlockGuard {
        let mut state = self.inner.state.lock().expect("timer state poisoned");
        if !state.expired {
            state.block_count += 1;
        }
        drop(state);
        BlockGuard {
            timer: self.clone(),
        }
    }

    /// Resolve once the timer has fired. Fires at most once per timer.
    pub async fn expired(&self) {
        let mut rx = self.inner.fired.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state.lock().expect("timer state poisoned").expired
    }

    fn unblock(&self) {
        let mut state = self.inner.state.lock().expect("timer state poisoned");
        if state.expired || state.block_count == 0 {
            return;
        }
        state.block_count -= 1;
        if state.block_count == 0 {
            state.deadline = Instant::now() + self.inner.timeout;
            drop(state);
            self.inner.rearm.notify_one();
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.timer.unblock();
    }
}

enum Tick {
    Fire,
    Defer,
    Stale,
}

async fn run(inner: Arc<Inner>) {
    loop {
        let deadline = inner
            .state
            .lock()
            .expect("timer state poisoned")
            .deadline;
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                let tick = {
                    let mut state = inner.state.lock().expect("timer state poisoned");
                    if state.deadline != deadline {
                        Tick::Stale
                    } else if state.block_count == 0 {
                        state.expired = true;
                        Tick::Fire
                    } else {
                        Tick::Defer
                    }
                };
                match tick {
                    Tick::Fire => {
                        let _ = inner.fired.send(true);
                        return;
                    }
                    // Tick arrived while blocked; hold expiry until the
                    // last guard re-arms us.
                    Tick::Defer => inner.rearm.notified().await,
                    Tick::Stale => {}
                }
            }
            () = inner.rearm.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(d: Duration) {
        tokio::time::advance(d).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_timeout() {
        let timer = SharedTimer::new(TIMEOUT);
        let start = Instant::now();
        timer.expired().await;
        assert!(Instant::now() - start >= TIMEOUT);
        assert!(timer.is_expired());

        // A second waiter resolves immediately.
        timer.expired().await;
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_before_timeout() {
        let timer = SharedTimer::new(TIMEOUT);
        settle().await;
        advance(TIMEOUT - Duration::from_millis(1)).await;
        assert!(!timer.is_expired());
        advance(Duration::from_millis(2)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn block_defers_expiry_and_rearms_fresh() {
        let timer = SharedTimer::new(TIMEOUT);
        settle().await;
        let guard = timer.block();

        // Tick arrives while blocked; expiry is deferred.
        advance(TIMEOUT * 3).await;
        assert!(!timer.is_expired());

        // Releasing the last guard grants a fresh full period, not an
        // instant fire.
        drop(guard);
        settle().await;
        assert!(!timer.is_expired());
        advance(TIMEOUT - Duration::from_millis(1)).await;
        assert!(!timer.is_expired());
        advance(Duration::from_millis(2)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn nested_blocks_require_all_guards_released() {
        let timer = SharedTimer::new(TIMEOUT);
        settle().await;
        let outer = timer.block();
        let inner = timer.block();

        advance(TIMEOUT * 2).await;
        drop(inner);
        advance(TIMEOUT * 2).await;
        assert!(!timer.is_expired());

        drop(outer);
        advance(TIMEOUT + Duration::from_millis(1)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn unblock_before_tick_still_rearms_fresh() {
        let timer = SharedTimer::new(TIMEOUT);
        settle().await;
        advance(TIMEOUT / 2).await;

        // Block and release half-way through; the period restarts.
        drop(timer.block());
        settle().await;
        advance(TIMEOUT - Duration::from_millis(1)).await;
        assert!(!timer.is_expired());
        advance(Duration::from_millis(2)).await;
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn block_after_expiry_is_noop() {
        let timer = SharedTimer::new(TIMEOUT);
        timer.expired().await;

        let guard = timer.block();
        drop(guard);
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_all_observe_expiry() {
        let timer = SharedTimer::new(TIMEOUT);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let timer = timer.clone();
                tokio::spawn(async move { timer.expired().await })
            })
            .collect();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert!(timer.is_expired());
    }
}

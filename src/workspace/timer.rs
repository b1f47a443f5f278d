//! Cancelable timers and the shared polling primitive.
//!
//! Cancellation never needs to reach the remote side: every completion is
//! re-checked against the session's generation counter when it is applied, so
//! a timer or poll loop that is canceled late simply has its result dropped.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Handle to a spawned timer or poll loop.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Spawn `task` on the current runtime.
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(task),
        }
    }

    /// Stop the timer. Canceling a fired or already-canceled timer is a no-op.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Result of one poll tick, as judged by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick<T> {
    /// A terminal answer; polling stops.
    Ready(T),
    /// Not there yet; counts toward `max_attempts`.
    Pending,
    /// The tick didn't produce an answer (network blip); not counted.
    Skipped,
    /// The owner went away or moved on; stop without an outcome.
    Abandon,
}

impl<T> Tick<T> {
    /// Whether the tick changed observable state. A skipped tick still
    /// records the failed check on the session.
    pub fn changed(&self) -> bool {
        !matches!(self, Tick::Abandon)
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    /// `max_attempts` pending ticks without a terminal answer.
    Exhausted { attempts: u32 },
    /// The wall-clock budget ran out first (e.g. every tick was skipped).
    BudgetElapsed { attempts: u32 },
    Abandoned,
}

/// Fixed-interval schedule bounded by both an attempt count and a wall clock.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_attempts: u32,
    pub budget: Duration,
}

/// Drive `tick` every `interval` until it reports a terminal answer, the
/// pending-attempt budget is spent, or the wall-clock budget elapses.
///
/// Ticks run strictly one after another: the next sleep starts only after the
/// previous tick's future has completed. `tick` receives the number of
/// pending attempts counted so far.
pub async fn poll_until<T, F, Fut>(schedule: PollSchedule, mut tick: F) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Tick<T>>,
{
    let deadline = Instant::now() + schedule.budget;
    let mut attempts = 0u32;

    loop {
        let next = Instant::now() + schedule.interval;
        if next > deadline {
            sleep_until(deadline).await;
            return PollOutcome::BudgetElapsed { attempts };
        }
        sleep_until(next).await;

        match tick(attempts).await {
            Tick::Ready(value) => return PollOutcome::Ready { value, attempts },
            Tick::Pending => {
                attempts += 1;
                if attempts >= schedule.max_attempts {
                    return PollOutcome::Exhausted { attempts };
                }
            }
            Tick::Skipped => {}
            Tick::Abandon => return PollOutcome::Abandoned,
        }
    }
}

use crate::actor::WeakActorClient;
use crate::consensus::election::timers::shared_deadline::SharedDeadline;
use crate::consensus::election::timers::time::{Clock, RealClock};
use crate::consensus::engine_api::ElectionTimeoutTick;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Fires an election timeout when no valid leader contact has reset it within a randomized
/// timeout. Each handle has a generation; every timeout event carries the generation and the
/// number of resets observed when it fired, so the engine can discard stale or raced events.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    deadline: SharedDeadline,
    resets: Arc<AtomicU64>,
    generation: u64,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    // Cancels the task's token when the handle goes away.
    _stop_on_drop: DropGuard,
}

struct ElectionTimerTask<C: Clock> {
    deadline: SharedDeadline,
    resets: Arc<AtomicU64>,
    generation: u64,
    actor_client: WeakActorClient,
    clock: C,
    stopped: CancellationToken,
    // Static pause between repeated timeouts while the engine hasn't replaced this timer.
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        generation: u64,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(generation, min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        // Arm before counting the reset: a task that misses the new deadline always sees the
        // bumped counter in the event it sends.
        self.deadline.arm(self.random_wake_time());
        self.resets.fetch_add(1, Ordering::AcqRel);
    }

    /// True if `tick` was produced by this timer and nothing re-armed it since.
    pub(crate) fn is_current(&self, tick: &ElectionTimeoutTick) -> bool {
        tick.generation == self.generation && tick.resets_seen == self.resets.load(Ordering::Acquire)
    }

    fn random_wake_time(&self) -> Instant {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + rand_timeout
    }
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        generation: u64,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let deadline = SharedDeadline::new();
        let resets = Arc::new(AtomicU64::new(0));
        let stopped = CancellationToken::new();

        let task = ElectionTimerTask {
            deadline: deadline.clone(),
            resets: resets.clone(),
            generation,
            actor_client,
            clock: clock.clone(),
            stopped: stopped.clone(),
            timeout_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            deadline,
            resets,
            generation,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
            _stop_on_drop: stopped.drop_guard(),
        };

        // The task must find a deadline when it starts, otherwise it would fire immediately.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            let resets_seen = self.resets.load(Ordering::Acquire);
            match self.deadline.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Slept until the deadline and nobody re-armed it.
                    if self.stopped.is_cancelled() {
                        return;
                    }
                    let tick = ElectionTimeoutTick {
                        generation: self.generation,
                        resets_seen,
                    };
                    if self.actor_client.election_timeout(tick).await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            // The handle was dropped: the engine left the state this timer belonged to.
            if self.stopped.is_cancelled() {
                return;
            }
        }
    }
}

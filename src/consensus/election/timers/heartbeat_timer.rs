use crate::actor::WeakActorClient;
use crate::consensus::election::timers::shared_deadline::SharedDeadline;
use crate::consensus::election::timers::time::{Clock, RealClock};
use crate::consensus::engine_api::HeartbeatTick;
use crate::consensus::{NodeId, Term};
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// Per-peer leader timer. Asks the engine to send AppendEntries to one peer whenever nothing was
/// sent to it for a heartbeat duration.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: SharedDeadline,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: SharedDeadline,
    actor_client: WeakActorClient,
    event: HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: NodeId,
        term: Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> HeartbeatTimerHandle<C> {
    /// Postpones the next heartbeat; called whenever something is sent to the peer.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        self.next_heartbeat_time
            .arm(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: NodeId,
        term: Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_heartbeat_time = SharedDeadline::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: next_heartbeat_time.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time,
            actor_client,
            event: HeartbeatTick { peer_id, term },
            clock,
        };

        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The deadline starts empty, so the first iteration fires right away: a new leader (or a
        // new member) gets its first heartbeat without waiting.
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => match self.weak_shared.upgrade() {
                    Some(shared) => {
                        if self.actor_client.heartbeat_timer(self.event.clone()).await.is_err() {
                            return;
                        }
                        shared.reset_heartbeat_timer();
                    }
                    // Handle dropped: no longer leader of this term, or the peer left.
                    None => return,
                },
            }
        }
    }
}

use crate::config::SeedPeer;
use crate::consensus::{JoinClusterInput, JoinClusterOutput, JoinReplyError, LeaderInfo, NodeId, PeerTransport, Term};
use tokio::time::{self, Duration, Instant};

pub(crate) struct JoinPolicy {
    pub(crate) attempt_timeout: Duration,
    pub(crate) deadline: Duration,
    pub(crate) initial_backoff: Duration,
    pub(crate) max_backoff: Duration,
}

#[derive(Debug, PartialEq)]
pub(crate) enum JoinOutcome {
    Joined { leader_id: NodeId, term: Term },
    WrongCluster { theirs: String },
    TimedOut { rounds: u32 },
}

/// Asks every seed in turn to let us in, following at most one redirect per seed, until one of
/// them answers for a leader or `deadline` passes. Rounds are separated by an exponential backoff.
/// `leader_known` is polled between rounds, so learning the leader some other way also ends it.
pub(crate) async fn join_via_seeds<F>(
    logger: &slog::Logger,
    transport: &dyn PeerTransport,
    seeds: &[SeedPeer],
    request: &JoinClusterInput,
    policy: &JoinPolicy,
    mut leader_known: F,
) -> JoinOutcome
where
    F: FnMut() -> Option<(NodeId, Term)>,
{
    let give_up_at = Instant::now() + policy.deadline;
    let mut backoff = policy.initial_backoff;
    let mut rounds = 0;

    loop {
        rounds += 1;
        for seed in seeds {
            if let Some((leader_id, term)) = leader_known() {
                return JoinOutcome::Joined { leader_id, term };
            }

            match attempt(logger, transport, &seed.address, request, policy.attempt_timeout).await {
                Ok(JoinClusterOutput::Accepted { leader_id, term }) => {
                    slog::info!(logger, "Joined through {} (leader {:?}, term {:?})", seed.address, leader_id, term);
                    return JoinOutcome::Joined { leader_id, term };
                }
                Ok(JoinClusterOutput::Redirect { leader, term }) => {
                    if let Some(outcome) = follow_redirect(logger, transport, &leader, term, request, policy).await {
                        return outcome;
                    }
                }
                Ok(JoinClusterOutput::NoLeader { term }) => {
                    slog::info!(logger, "Seed {} has no leader yet (term {:?})", seed.address, term);
                }
                Err(JoinReplyError::WrongCluster(theirs)) => {
                    slog::error!(logger, "Seed {} belongs to cluster '{}'", seed.address, theirs);
                    return JoinOutcome::WrongCluster { theirs };
                }
                Err(JoinReplyError::RetryableFailure(message)) => {
                    slog::warn!(logger, "Join via {} failed: {}", seed.address, message);
                }
            }
        }

        let now = Instant::now();
        if now >= give_up_at {
            return JoinOutcome::TimedOut { rounds };
        }
        time::sleep(std::cmp::min(backoff, give_up_at - now)).await;
        backoff = std::cmp::min(backoff * 2, policy.max_backoff);
    }
}

async fn follow_redirect(
    logger: &slog::Logger,
    transport: &dyn PeerTransport,
    leader: &LeaderInfo,
    term: Term,
    request: &JoinClusterInput,
    policy: &JoinPolicy,
) -> Option<JoinOutcome> {
    slog::info!(logger, "Redirected to leader {:?} at {} (term {:?})", leader.node_id, leader.address, term);
    match attempt(logger, transport, &leader.address, request, policy.attempt_timeout).await {
        Ok(JoinClusterOutput::Accepted { leader_id, term }) => Some(JoinOutcome::Joined { leader_id, term }),
        Err(JoinReplyError::WrongCluster(theirs)) => Some(JoinOutcome::WrongCluster { theirs }),
        other => {
            slog::info!(logger, "Leader {:?} did not accept us yet: {:?}", leader.node_id, other);
            None
        }
    }
}

async fn attempt(
    logger: &slog::Logger,
    transport: &dyn PeerTransport,
    address: &str,
    request: &JoinClusterInput,
    attempt_timeout: Duration,
) -> Result<JoinClusterOutput, JoinReplyError> {
    slog::debug!(logger, "Asking {} to join", address);
    match time::timeout(attempt_timeout, transport.join_cluster(address, request.clone())).await {
        Ok(result) => result,
        Err(_) => Err(JoinReplyError::RetryableFailure(format!("Timed out joining via {}", address))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{
        AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, PeerReplyError,
        PeerTarget, RequestVoteInput, RequestVoteOutput,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers joins from a fixed script per address; everything else is unreachable.
    struct ScriptedSeeds {
        replies: Mutex<HashMap<String, Vec<Result<JoinClusterOutput, JoinReplyError>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSeeds {
        fn new(script: Vec<(&str, Vec<Result<JoinClusterOutput, JoinReplyError>>)>) -> Self {
            ScriptedSeeds {
                replies: Mutex::new(script.into_iter().map(|(a, r)| (a.to_string(), r)).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PeerTransport for ScriptedSeeds {
        async fn request_vote(&self, _: &PeerTarget, _: RequestVoteInput) -> Result<RequestVoteOutput, PeerReplyError> {
            unimplemented!()
        }

        async fn append_entries(
            &self,
            _: &PeerTarget,
            _: AppendEntriesInput,
        ) -> Result<AppendEntriesOutput, PeerReplyError> {
            unimplemented!()
        }

        async fn install_snapshot(
            &self,
            _: &PeerTarget,
            _: InstallSnapshotInput,
        ) -> Result<InstallSnapshotOutput, PeerReplyError> {
            unimplemented!()
        }

        async fn join_cluster(&self, address: &str, _: JoinClusterInput) -> Result<JoinClusterOutput, JoinReplyError> {
            self.calls.lock().unwrap().push(address.to_string());
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(address) {
                Some(script) if !script.is_empty() => script.remove(0),
                _ => Err(JoinReplyError::RetryableFailure("unreachable".into())),
            }
        }
    }

    fn seeds(addresses: &[&str]) -> Vec<SeedPeer> {
        addresses
            .iter()
            .enumerate()
            .map(|(i, a)| SeedPeer {
                node_id: format!("s{}", i),
                address: a.to_string(),
            })
            .collect()
    }

    fn request() -> JoinClusterInput {
        JoinClusterInput {
            node_id: NodeId::new("me"),
            address: "me:1".into(),
            cluster_name: "prod".into(),
        }
    }

    fn policy() -> JoinPolicy {
        JoinPolicy {
            attempt_timeout: Duration::from_millis(50),
            deadline: Duration::from_millis(300),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn follows_redirect_to_leader() {
        let transport = ScriptedSeeds::new(vec![
            (
                "a:1",
                vec![Ok(JoinClusterOutput::Redirect {
                    leader: LeaderInfo {
                        node_id: NodeId::new("L"),
                        address: "leader:1".into(),
                    },
                    term: Term::new(2),
                })],
            ),
            (
                "leader:1",
                vec![Ok(JoinClusterOutput::Accepted {
                    leader_id: NodeId::new("L"),
                    term: Term::new(2),
                })],
            ),
        ]);

        let outcome = join_via_seeds(&logger(), &transport, &seeds(&["a:1"]), &request(), &policy(), || None).await;

        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                leader_id: NodeId::new("L"),
                term: Term::new(2)
            }
        );
        assert_eq!(*transport.calls.lock().unwrap(), vec!["a:1", "leader:1"]);
    }

    #[tokio::test]
    async fn retries_until_a_leader_exists() {
        let transport = ScriptedSeeds::new(vec![(
            "a:1",
            vec![
                Ok(JoinClusterOutput::NoLeader { term: Term::new(1) }),
                Ok(JoinClusterOutput::NoLeader { term: Term::new(1) }),
                Ok(JoinClusterOutput::Accepted {
                    leader_id: NodeId::new("s0"),
                    term: Term::new(2),
                }),
            ],
        )]);

        let outcome = join_via_seeds(&logger(), &transport, &seeds(&["a:1", "b:1"]), &request(), &policy(), || None).await;

        assert!(matches!(outcome, JoinOutcome::Joined { .. }));
        assert_eq!(transport.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn wrong_cluster_stops_immediately() {
        let transport = ScriptedSeeds::new(vec![("a:1", vec![Err(JoinReplyError::WrongCluster("staging".into()))])]);

        let outcome = join_via_seeds(&logger(), &transport, &seeds(&["a:1", "b:1"]), &request(), &policy(), || None).await;

        assert_eq!(
            outcome,
            JoinOutcome::WrongCluster {
                theirs: "staging".into()
            }
        );
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_deadline() {
        let transport = ScriptedSeeds::new(vec![]);
        let started = Instant::now();

        let outcome = join_via_seeds(&logger(), &transport, &seeds(&["a:1"]), &request(), &policy(), || None).await;

        match outcome {
            JoinOutcome::TimedOut { rounds } => assert!(rounds >= 2),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn leader_learned_elsewhere_ends_join() {
        let transport = ScriptedSeeds::new(vec![]);

        let outcome = join_via_seeds(&logger(), &transport, &seeds(&["a:1"]), &request(), &policy(), || {
            Some((NodeId::new("L"), Term::new(7)))
        })
        .await;

        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                leader_id: NodeId::new("L"),
                term: Term::new(7)
            }
        );
        assert!(transport.calls.lock().unwrap().is_empty());
    }
}

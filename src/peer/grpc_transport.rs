use crate::commitlog::{index_to_u64, Index};
use crate::consensus::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, JoinClusterInput,
    JoinClusterOutput, JoinReplyError, LeaderInfo, NodeId, PeerReplyError, PeerTarget, PeerTransport,
    RequestVoteInput, RequestVoteOutput, Term,
};
use crate::grpc::grpc_discovery_client::GrpcDiscoveryClient;
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_join_error, proto_join_result, proto_request_vote_error,
    proto_request_vote_result, ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq,
    ProtoInstallSnapshotResult, ProtoJoinReq, ProtoJoinResult, ProtoLogEntry, ProtoRequestVoteReq,
    ProtoRequestVoteResult,
};
use crate::peer::PeerConnections;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// Outbound consensus and join traffic over gRPC. One lazily connected channel is shared per
/// peer address.
pub(crate) struct GrpcPeerTransport {
    logger: slog::Logger,
    channels: PeerConnections<Channel>,
}

impl GrpcPeerTransport {
    pub(crate) fn new(logger: slog::Logger) -> Self {
        GrpcPeerTransport {
            logger,
            channels: PeerConnections::new(),
        }
    }

    async fn channel(&self, address: &str) -> Result<Channel, String> {
        let logger = &self.logger;
        self.channels
            .get_or_connect(address, || async move {
                let endpoint = Endpoint::from_shared(format!("http://{}", address))
                    .map_err(|e| format!("Invalid peer address '{}': {}", address, e))?;
                slog::info!(logger, "Opening channel to {}", address);
                endpoint
                    .connect_lazy()
                    .map_err(|e| format!("Failed to open channel to '{}': {}", address, e))
            })
            .await
    }

    fn call_failed(&self, address: &str, status: Status) -> String {
        // A broken channel is rebuilt on next use.
        if status.code() == Code::Unavailable {
            self.channels.forget(address);
        }
        format!("{}: {}", address, status)
    }

    fn convert_request_vote_result(result: ProtoRequestVoteResult) -> Result<RequestVoteOutput, PeerReplyError> {
        match result.result {
            Some(proto_request_vote_result::Result::Ok(ok)) => Ok(RequestVoteOutput {
                vote_granted: ok.vote_granted,
                current_term: Term::new(ok.current_term),
            }),
            Some(proto_request_vote_result::Result::Err(err)) => Err(match err.err {
                Some(proto_request_vote_error::Err::StaleTerm(stale)) => PeerReplyError::StaleTerm {
                    new_term: Term::new(stale.current_term),
                },
                Some(proto_request_vote_error::Err::ClientNotInCluster(_)) => PeerReplyError::NotInCluster,
                Some(proto_request_vote_error::Err::ServerFault(fault)) => PeerReplyError::RetryableFailure(fault.message),
                None => PeerReplyError::RetryableFailure("Empty RequestVote error".into()),
            }),
            None => Err(PeerReplyError::RetryableFailure("Empty RequestVote result".into())),
        }
    }

    fn convert_append_entries_result(
        result: ProtoAppendEntriesResult,
    ) -> Result<AppendEntriesOutput, PeerReplyError> {
        match result.result {
            Some(proto_append_entries_result::Result::Ok(ok)) => Ok(AppendEntriesOutput {
                matched_index: Index::from_u64_opt(ok.matched_index),
            }),
            Some(proto_append_entries_result::Result::Err(err)) => Err(match err.err {
                Some(proto_append_entries_error::Err::StaleTerm(stale)) => PeerReplyError::StaleTerm {
                    new_term: Term::new(stale.current_term),
                },
                Some(proto_append_entries_error::Err::MissingLog(missing)) => {
                    PeerReplyError::PeerMissingPreviousLogEntry {
                        last_log_index: Index::from_u64_opt(missing.last_log_entry_index),
                    }
                }
                Some(proto_append_entries_error::Err::ServerFault(fault)) => {
                    PeerReplyError::RetryableFailure(fault.message)
                }
                None => PeerReplyError::RetryableFailure("Empty AppendEntries error".into()),
            }),
            None => Err(PeerReplyError::RetryableFailure("Empty AppendEntries result".into())),
        }
    }

    fn convert_install_snapshot_result(
        result: ProtoInstallSnapshotResult,
    ) -> Result<InstallSnapshotOutput, PeerReplyError> {
        match result.result {
            Some(proto_install_snapshot_result::Result::Ok(ok)) => Ok(InstallSnapshotOutput {
                matched_index: Index::from_u64_opt(ok.matched_index),
            }),
            Some(proto_install_snapshot_result::Result::Err(err)) => Err(match err.err {
                Some(proto_install_snapshot_error::Err::StaleTerm(stale)) => PeerReplyError::StaleTerm {
                    new_term: Term::new(stale.current_term),
                },
                Some(proto_install_snapshot_error::Err::ServerFault(fault)) => {
                    PeerReplyError::RetryableFailure(fault.message)
                }
                None => PeerReplyError::RetryableFailure("Empty InstallSnapshot error".into()),
            }),
            None => Err(PeerReplyError::RetryableFailure("Empty InstallSnapshot result".into())),
        }
    }

    fn convert_join_result(result: ProtoJoinResult) -> Result<JoinClusterOutput, JoinReplyError> {
        match result.result {
            Some(proto_join_result::Result::Accepted(accepted)) => Ok(JoinClusterOutput::Accepted {
                leader_id: NodeId::new(accepted.leader_node_id),
                term: Term::new(accepted.term),
            }),
            Some(proto_join_result::Result::Redirect(redirect)) => Ok(JoinClusterOutput::Redirect {
                leader: LeaderInfo {
                    node_id: NodeId::new(redirect.leader_node_id),
                    address: redirect.leader_address,
                },
                term: Term::new(redirect.term),
            }),
            Some(proto_join_result::Result::NoLeader(no_leader)) => Ok(JoinClusterOutput::NoLeader {
                term: Term::new(no_leader.term),
            }),
            Some(proto_join_result::Result::Err(err)) => Err(match err.err {
                Some(proto_join_error::Err::WrongCluster(wrong)) => JoinReplyError::WrongCluster(wrong.cluster_name),
                Some(proto_join_error::Err::ServerFault(fault)) => JoinReplyError::RetryableFailure(fault.message),
                None => JoinReplyError::RetryableFailure("Empty Join error".into()),
            }),
            None => Err(JoinReplyError::RetryableFailure("Empty Join result".into())),
        }
    }
}

fn log_entry_metadata(entry: Option<(Term, Index)>) -> (u64, u64) {
    match entry {
        Some((term, index)) => (term.as_u64(), index.as_u64()),
        None => (0, 0),
    }
}

#[async_trait::async_trait]
impl PeerTransport for GrpcPeerTransport {
    async fn request_vote(
        &self,
        peer: &PeerTarget,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, PeerReplyError> {
        let channel = self
            .channel(&peer.address)
            .await
            .map_err(PeerReplyError::RetryableFailure)?;
        let (last_log_entry_term, last_log_entry_index) = log_entry_metadata(input.candidate_last_log_entry);
        let request = ProtoRequestVoteReq {
            client_node_id: input.candidate_id.into_inner(),
            client_address: input.candidate_address,
            term: input.candidate_term.as_u64(),
            last_log_entry_term,
            last_log_entry_index,
        };

        let result = GrpcRaftClient::new(channel)
            .request_vote(request)
            .await
            .map_err(|status| PeerReplyError::RetryableFailure(self.call_failed(&peer.address, status)))?;
        Self::convert_request_vote_result(result.into_inner())
    }

    async fn append_entries(
        &self,
        peer: &PeerTarget,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, PeerReplyError> {
        let channel = self
            .channel(&peer.address)
            .await
            .map_err(PeerReplyError::RetryableFailure)?;
        let (previous_log_entry_term, previous_log_entry_index) =
            log_entry_metadata(input.leader_previous_log_entry);
        let request = ProtoAppendEntriesReq {
            client_node_id: input.leader_id.into_inner(),
            client_address: input.leader_address,
            term: input.leader_term.as_u64(),
            commit_index: index_to_u64(input.leader_commit_index),
            previous_log_entry_term,
            previous_log_entry_index,
            new_entries: input
                .new_entries
                .into_iter()
                .map(|entry| ProtoLogEntry {
                    term: entry.term.as_u64(),
                    data: entry.data,
                })
                .collect(),
        };

        let result = GrpcRaftClient::new(channel)
            .append_entries(request)
            .await
            .map_err(|status| PeerReplyError::RetryableFailure(self.call_failed(&peer.address, status)))?;
        Self::convert_append_entries_result(result.into_inner())
    }

    async fn install_snapshot(
        &self,
        peer: &PeerTarget,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerReplyError> {
        let cluster_state = input
            .snapshot
            .encode()
            .map_err(|e| PeerReplyError::RetryableFailure(format!("Failed to encode snapshot: {}", e)))?;
        let channel = self
            .channel(&peer.address)
            .await
            .map_err(PeerReplyError::RetryableFailure)?;
        let request = ProtoInstallSnapshotReq {
            client_node_id: input.leader_id.into_inner(),
            client_address: input.leader_address,
            term: input.leader_term.as_u64(),
            last_included_term: input.snapshot.term,
            last_included_index: input.snapshot.index,
            cluster_state,
        };

        let result = GrpcRaftClient::new(channel)
            .install_snapshot(request)
            .await
            .map_err(|status| PeerReplyError::RetryableFailure(self.call_failed(&peer.address, status)))?;
        Self::convert_install_snapshot_result(result.into_inner())
    }

    async fn join_cluster(&self, address: &str, input: JoinClusterInput) -> Result<JoinClusterOutput, JoinReplyError> {
        let channel = self.channel(address).await.map_err(JoinReplyError::RetryableFailure)?;
        let request = ProtoJoinReq {
            client_node_id: input.node_id.into_inner(),
            client_address: input.address,
            cluster_name: input.cluster_name,
        };
        slog::debug!(self.logger, "ClientWire - {:?}", request);

        let result = GrpcDiscoveryClient::new(channel)
            .join(request)
            .await
            .map_err(|status| JoinReplyError::RetryableFailure(self.call_failed(address, status)))?;
        slog::debug!(self.logger, "ClientWire - {:?}", result);
        Self::convert_join_result(result.into_inner())
    }

    fn forget_address(&self, address: &str) {
        if self.channels.forget(address) {
            slog::info!(self.logger, "Closed channel to {}", address);
        }
    }
}

use crate::actor::WeakActorClient;
use crate::commitlog::{index_to_u64, Index};
use crate::consensus::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, JoinClusterError, JoinClusterInput, JoinClusterOutput, LogEntry, NodeId,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, Snapshot, Term,
};
use crate::grpc::grpc_discovery_server::{GrpcDiscovery, GrpcDiscoveryServer};
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_join_error, proto_join_result, proto_request_vote_error,
    proto_request_vote_result, ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoAppendEntriesSuccess, ProtoClientNotInCluster, ProtoClientStaleTerm, ProtoInstallSnapshotError,
    ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess, ProtoJoinAccepted,
    ProtoJoinError, ProtoJoinReq, ProtoJoinResult, ProtoLeaderRedirect, ProtoNoLeader, ProtoRequestVoteError,
    ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault,
    ProtoServerMissingPreviousLog, ProtoWrongCluster,
};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

#[derive(Debug, thiserror::Error)]
pub enum RpcServerError {
    #[error("Failed to bind RPC listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("RPC server failed")]
    Serve(#[source] tonic::transport::Error),
}

/// Binds the RPC listener up front, so an unusable port is reported before anything else starts.
pub(crate) async fn bind(addr: SocketAddr) -> Result<TcpListener, RpcServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RpcServerError::Bind { addr, source })
}

/// RpcServer is the type that implements both the Discovery and Raft gRPC interfaces. Every call
/// is forwarded to the local engine's actor.
#[derive(Clone)]
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_engine: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_engine: WeakActorClient) -> Self {
        RpcServer { logger, local_engine }
    }

    /// Serves until `shutdown` is cancelled. In-flight calls finish first.
    pub(crate) async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), RpcServerError> {
        let logger = self.logger.clone();
        match listener.local_addr() {
            Ok(addr) => slog::info!(logger, "Listening on '{:?}'", addr),
            Err(e) => slog::warn!(logger, "Listening on unknown address: {:?}", e),
        }

        let result = Server::builder()
            .add_service(GrpcDiscoveryServer::new(self.clone()))
            .add_service(GrpcRaftServer::new(self))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await;

        slog::info!(logger, "Server serve() has exited: {:?}", result);
        result.map_err(RpcServerError::Serve)
    }

    // ------- RequestVote --------

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_engine.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: NodeId::new(rpc_request.client_node_id),
            candidate_address: rpc_request.client_address,
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoRequestVoteResult {
                    result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                        vote_granted: ok.vote_granted,
                        current_term: ok.current_term.as_u64(),
                    })),
                }
            }
            Err(RequestVoteError::CandidateNotInCluster) => {
                proto_request_vote_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(RequestVoteError::RequestTermOutOfDate(term_info)) => {
                proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(e @ RequestVoteError::ActorExited) => {
                proto_request_vote_error::Err::ServerFault(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(err),
            })),
        }
    }

    // ------- AppendEntries --------

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_engine.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            new_entries.push(LogEntry {
                term: Term::new(proto_entry.term),
                data: proto_entry.data,
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: NodeId::new(rpc_request.client_node_id),
            leader_address: rpc_request.client_address,
            leader_previous_log_entry,
            leader_commit_index: Index::from_u64_opt(rpc_request.commit_index),
            new_entries,
        })
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                        matched_index: index_to_u64(ok.matched_index),
                    })),
                }
            }
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: index_to_u64(last_log_index),
                })
            }
            Err(
                e @ AppendEntriesError::ConflictsWithCommitted(_)
                | e @ AppendEntriesError::ServerIoError(_)
                | e @ AppendEntriesError::ActorExited,
            ) => proto_append_entries_error::Err::ServerFault(ProtoServerFault { message: e.to_string() }),
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }
    }

    // ------- InstallSnapshot --------

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = Self::convert_install_snapshot_input(rpc_request)?;
        let app_result = self.local_engine.install_snapshot(app_input).await;
        let rpc_reply = Self::convert_install_snapshot_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, Status> {
        let snapshot = Snapshot::decode(
            rpc_request.last_included_term,
            rpc_request.last_included_index,
            &rpc_request.cluster_state,
        )
        .map_err(|e| Status::invalid_argument(format!("Undecodable cluster state: {}", e)))?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: NodeId::new(rpc_request.client_node_id),
            leader_address: rpc_request.client_address,
            snapshot,
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        matched_index: index_to_u64(ok.matched_index),
                    })),
                }
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                })
            }
            Err(e @ InstallSnapshotError::ServerIoError(_)) | Err(e @ InstallSnapshotError::ActorExited) => {
                proto_install_snapshot_error::Err::ServerFault(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        }
    }

    // ------- Join --------

    async fn handle_join(&self, rpc_request: ProtoJoinReq) -> Result<ProtoJoinResult, Status> {
        if rpc_request.client_node_id.is_empty() || rpc_request.client_address.is_empty() {
            return Err(Status::invalid_argument("Join requires a node id and address"));
        }
        let app_input = JoinClusterInput {
            node_id: NodeId::new(rpc_request.client_node_id),
            address: rpc_request.client_address,
            cluster_name: rpc_request.cluster_name,
        };
        let app_result = self.local_engine.join_cluster(app_input).await;
        Ok(Self::convert_join_result(app_result))
    }

    fn convert_join_result(app_result: Result<JoinClusterOutput, JoinClusterError>) -> ProtoJoinResult {
        let result = match app_result {
            Ok(JoinClusterOutput::Accepted { leader_id, term }) => proto_join_result::Result::Accepted(ProtoJoinAccepted {
                leader_node_id: leader_id.into_inner(),
                term: term.as_u64(),
            }),
            Ok(JoinClusterOutput::Redirect { leader, term }) => proto_join_result::Result::Redirect(ProtoLeaderRedirect {
                leader_node_id: leader.node_id.into_inner(),
                leader_address: leader.address,
                term: term.as_u64(),
            }),
            Ok(JoinClusterOutput::NoLeader { term }) => {
                proto_join_result::Result::NoLeader(ProtoNoLeader { term: term.as_u64() })
            }
            Err(JoinClusterError::WrongCluster { expected }) => proto_join_result::Result::Err(ProtoJoinError {
                err: Some(proto_join_error::Err::WrongCluster(ProtoWrongCluster {
                    cluster_name: expected,
                })),
            }),
            Err(e @ JoinClusterError::ActorExited) => proto_join_result::Result::Err(ProtoJoinError {
                err: Some(proto_join_error::Err::ServerFault(ProtoServerFault { message: e.to_string() })),
            }),
        };

        ProtoJoinResult { result: Some(result) }
    }

    // ------- Shared --------

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument("LogEntryTerm 0 and LogEntryIndex non-0")),
            (_, 0) => Err(Status::invalid_argument("LogEntryIndex 0 and LogEntryTerm non-0")),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot from {} through {}",
            rpc_request.client_node_id,
            rpc_request.last_included_index
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[async_trait::async_trait]
impl GrpcDiscovery for RpcServer {
    async fn join(&self, rpc_request_wrapped: Request<ProtoJoinReq>) -> Result<Response<ProtoJoinResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_join(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::TermOutOfDateInfo;

    #[test]
    fn log_entry_metadata_must_be_all_or_nothing() {
        assert_eq!(RpcServer::convert_log_entry_metadata(0, 0).unwrap(), None);
        assert_eq!(
            RpcServer::convert_log_entry_metadata(3, 9).unwrap(),
            Some((Term::new(3), Index::new(9)))
        );
        assert!(RpcServer::convert_log_entry_metadata(0, 9).is_err());
        assert!(RpcServer::convert_log_entry_metadata(3, 0).is_err());
    }

    #[test]
    fn append_entries_errors_are_encoded() {
        let stale = RpcServer::convert_append_entries_result(Err(AppendEntriesError::ClientTermOutOfDate(
            TermOutOfDateInfo {
                current_term: Term::new(5),
            },
        )));
        match stale.result {
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::StaleTerm(s)),
            })) => assert_eq!(s.current_term, 5),
            other => panic!("Unexpected {:?}", other),
        }

        let missing = RpcServer::convert_append_entries_result(Err(
            AppendEntriesError::ServerMissingPreviousLogEntry {
                last_log_index: Some(Index::new(4)),
            },
        ));
        match missing.result {
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(m)),
            })) => assert_eq!(m.last_log_entry_index, 4),
            other => panic!("Unexpected {:?}", other),
        }

        let ok = RpcServer::convert_append_entries_result(Ok(AppendEntriesOutput { matched_index: None }));
        match ok.result {
            Some(proto_append_entries_result::Result::Ok(s)) => assert_eq!(s.matched_index, 0),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn wrong_cluster_join_is_encoded() {
        let result = RpcServer::convert_join_result(Err(JoinClusterError::WrongCluster {
            expected: "prod".into(),
        }));
        match result.result {
            Some(proto_join_result::Result::Err(ProtoJoinError {
                err: Some(proto_join_error::Err::WrongCluster(w)),
            })) => assert_eq!(w.cluster_name, "prod"),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        match bind(addr).await {
            Err(RpcServerError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("Expected bind failure, got {:?}", other.map(|_| ())),
        }
    }
}

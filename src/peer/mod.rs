mod connections;
mod grpc_transport;

pub(crate) use connections::PeerConnections;
pub(crate) use grpc_transport::GrpcPeerTransport;

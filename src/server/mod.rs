mod server;

pub(crate) use server::bind;
pub(crate) use server::RpcServer;
pub use server::RpcServerError;

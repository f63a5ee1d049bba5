use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum AddressResolveError {
    #[error("Failed to resolve address '{address}'")]
    Lookup {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Address '{0}' resolved to nothing")]
    NoAddress(String),
}

/// Resolves `host:port` into the first socket address it maps to. DNS names are allowed.
pub async fn resolve(address: &str) -> Result<SocketAddr, AddressResolveError> {
    let mut resolved = tokio::net::lookup_host(address)
        .await
        .map_err(|source| AddressResolveError::Lookup {
            address: address.to_string(),
            source,
        })?;

    resolved
        .next()
        .ok_or_else(|| AddressResolveError::NoAddress(address.to_string()))
}

/// Joins host and port, bracketing bare IPv6 literals.
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

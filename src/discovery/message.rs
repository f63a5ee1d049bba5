use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest datagram the listener reads. Anything longer arrives truncated and fails to decode.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Announcement a node multicasts so others can find it. JSON encoded on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    pub sender_id: String,
    /// RPC address (`host:port`) of the sender.
    pub sender_address: String,
    pub cluster_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryCodecError {
    #[error("Malformed discovery datagram")]
    Malformed(#[source] serde_json::Error),

    #[error("Failed to encode discovery message")]
    Encode(#[source] serde_json::Error),

    #[error("Discovery message is {0} bytes; at most {} fit in a datagram", MAX_DATAGRAM_SIZE)]
    TooLarge(usize),
}

impl DiscoveryMessage {
    pub fn new(sender_id: &str, sender_address: &str, cluster_name: &str) -> Self {
        DiscoveryMessage {
            sender_id: sender_id.to_string(),
            sender_address: sender_address.to_string(),
            cluster_name: cluster_name.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryCodecError> {
        let bytes = serde_json::to_vec(self).map_err(DiscoveryCodecError::Encode)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryCodecError::TooLarge(bytes.len()));
        }

        Ok(bytes)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, DiscoveryCodecError> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(DiscoveryCodecError::TooLarge(datagram.len()));
        }
        serde_json::from_slice(datagram).map_err(DiscoveryCodecError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_camel_case_json() {
        let message = DiscoveryMessage::new("node-1", "10.0.0.1:7000", "prod");
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();

        assert_eq!(json["senderId"], "node-1");
        assert_eq!(json["senderAddress"], "10.0.0.1:7000");
        assert_eq!(json["clusterName"], "prod");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn decode_accepts_peer_datagram() {
        let datagram = br#"{"senderId":"n2","senderAddress":"10.0.0.2:7000","clusterName":"prod","timestamp":"2024-01-02T03:04:05Z"}"#;
        let message = DiscoveryMessage::decode(datagram).unwrap();

        assert_eq!(message.sender_id, "n2");
        assert_eq!(message.sender_address, "10.0.0.2:7000");
        assert_eq!(message.cluster_name, "prod");
    }

    #[test]
    fn garbage_and_oversized_are_rejected() {
        assert!(matches!(
            DiscoveryMessage::decode(b"\x00\x01not json"),
            Err(DiscoveryCodecError::Malformed(_))
        ));
        // Truncated by the read buffer.
        assert!(matches!(
            DiscoveryMessage::decode(br#"{"senderId":"n2","sender"#),
            Err(DiscoveryCodecError::Malformed(_))
        ));

        let huge = DiscoveryMessage::new(&"x".repeat(MAX_DATAGRAM_SIZE), "a:1", "prod");
        assert!(matches!(huge.encode(), Err(DiscoveryCodecError::TooLarge(_))));
    }
}

//! Node-to-node message envelope.

use crate::entities::NodeAddr;
use crate::errors::ProtocolError;
use serde::{Deserialize, Serialize};

/// Current protocol version for coordination messages.
pub const PROTOCOL_VERSION: u16 = 1;

/// Wrapper for all node-to-node traffic. The `sender` field is the sole
/// authority on message origin; payloads carry no sender identity of their
/// own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub sender: NodeAddr,
    pub version: u16,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(sender: NodeAddr, payload: T) -> Self {
        Self {
            sender,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Reject envelopes from a different protocol generation before the
    /// payload is interpreted.
    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_current_version() {
        let env = Envelope::new(NodeAddr::new("10.0.0.1:7000"), 42u32);
        assert_eq!(env.version, PROTOCOL_VERSION);
        assert!(env.check_version().is_ok());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut env = Envelope::new(NodeAddr::new("10.0.0.1:7000"), ());
        env.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            env.check_version(),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }
}

use rand::RngCore;

use crate::hash_id::Id20;

/// Azureus-style client prefix sent in the BEP 3 handshake.
const CLIENT_PREFIX: &[u8; 8] = b"-BS0101-";

/// The 20-byte peer id used on TCP peer connections.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub Id20);

impl PeerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(CLIENT_PREFIX);
        rand::thread_rng().fill_bytes(&mut bytes[8..]);
        PeerId(Id20(bytes))
    }

    pub fn from_bytes_exact(bytes: [u8; 20]) -> Self {
        PeerId(Id20(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0 .0
    }

    /// Best-effort decode of an Azureus-style `-XX1234-` prefix for logs.
    pub fn client_name(&self) -> Option<String> {
        let b = &self.0 .0;
        if b[0] != b'-' || b[7] != b'-' {
            return None;
        }
        if !b[1..7].iter().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(String::from_utf8_lossy(&b[1..7]).into_owned())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.client_name() {
            Some(name) => write!(f, "{name}:{:?}", self.0),
            None => std::fmt::Debug::fmt(&self.0, f),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::HashUtils;

/// Identifier length in bytes (160 bits).
pub const ID_LENGTH: usize = 20;

/// 160-bit identifier naming both nodes and content keys.
///
/// The derived `Ord` compares bytes most-significant first, so ordering two
/// distances with it is the Kademlia "closer than" relation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LENGTH]);

impl NodeId {
    /// Create a new NodeId from raw bytes
    pub fn new(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The all-zero identifier
    pub fn zero() -> Self {
        Self([0u8; ID_LENGTH])
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Content key: SHA-1 digest of `data`
    pub fn from_content(data: &[u8]) -> Self {
        Self(HashUtils::digest(data))
    }

    /// XOR distance between two identifiers
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; ID_LENGTH];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Strict byte-lexicographic comparison
    pub fn less(&self, other: &NodeId) -> bool {
        self < other
    }

    /// Position of the highest set bit, counting from the most significant
    /// bit of the first byte. `None` for the zero identifier.
    pub fn leading_bit(&self) -> Option<usize> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LENGTH {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; ID_LENGTH];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

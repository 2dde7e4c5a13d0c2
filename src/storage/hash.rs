use sha1::{Digest, Sha1};

use crate::network::dht::{NodeId, ID_LENGTH};

pub struct HashUtils;

impl HashUtils {
    /// SHA-1 digest of `data`, truncated to the identifier length.
    pub fn digest(data: &[u8]) -> [u8; ID_LENGTH] {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_LENGTH];
        bytes.copy_from_slice(&hash[..ID_LENGTH]);
        bytes
    }

    /// Whether `data` is the content addressed by `key`.
    pub fn verify_data(data: &[u8], key: &NodeId) -> bool {
        NodeId::from_content(data) == *key
    }
}

use alloy_signer::{Signature, SignerSync};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ConsensusError;

/// Milliseconds since the Unix epoch.
pub fn current_timestamp() -> Result<u64, ConsensusError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hash of `left || right`, used to fold a sequence of keys into one digest.
pub fn hash_pair(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Deterministic 32-bit identifier derived from a public key.
pub fn peer_id(pub_key: &[u8]) -> u32 {
    let digest = sha256(pub_key);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Number of participants that forms a super-majority (more than 2/3) of `n`.
pub fn super_majority(n: usize) -> usize {
    2 * n / 3 + 1
}

/// Minimum number of participants guaranteed to contain an honest one.
pub fn trust_count(n: usize) -> usize {
    if n <= 1 { 0 } else { n.div_ceil(3) }
}

pub fn sign_digest<S: SignerSync>(signer: &S, digest: &[u8]) -> Result<Vec<u8>, ConsensusError> {
    let signature = signer.sign_message_sync(digest)?;
    Ok(signature.as_bytes().to_vec())
}

/// Recover the address that produced `signature` over `message`.
pub fn recover_signer(signature: &[u8], message: &[u8]) -> Result<Vec<u8>, ConsensusError> {
    if signature.is_empty() {
        return Err(ConsensusError::EmptySignature);
    }
    let signature_bytes: [u8; 65] =
        signature
            .try_into()
            .map_err(|_| ConsensusError::MismatchedLength {
                expect: 65,
                actual: signature.len(),
            })?;
    let signature = Signature::from_raw_array(&signature_bytes)?;
    let address = signature.recover_address_from_msg(message)?;
    Ok(address.as_slice().to_vec())
}

pub fn verify_signature(
    signature: &[u8],
    public_key: &[u8],
    message: &[u8],
) -> Result<bool, ConsensusError> {
    Ok(recover_signer(signature, message)? == public_key)
}

/// Middle element of the sorted values (upper median for even lengths).
pub fn median(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}

pub fn short_hex(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    encoded.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_thresholds() {
        let expected_super_majority = [(1, 1), (2, 2), (3, 3), (4, 3), (5, 4), (6, 5), (7, 5)];
        for (n, sm) in expected_super_majority {
            assert_eq!(super_majority(n), sm, "super majority of {n}");
        }

        assert_eq!(trust_count(0), 0);
        assert_eq!(trust_count(1), 0);
        assert_eq!(trust_count(2), 1);
        assert_eq!(trust_count(3), 1);
        assert_eq!(trust_count(4), 2);
        assert_eq!(trust_count(7), 3);
    }

    #[test]
    fn median_takes_upper_middle() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![5]), Some(5));
        assert_eq!(median(vec![9, 1, 5]), Some(5));
        assert_eq!(median(vec![4, 1, 3, 2]), Some(3));
    }

    #[test]
    fn signature_recovers_signer_address() {
        use alloy::signers::local::PrivateKeySigner;

        let signer = PrivateKeySigner::random();
        let digest = sha256(b"payload");
        let signature = sign_digest(&signer, &digest).unwrap();

        let address = signer.address().as_slice().to_vec();
        assert!(verify_signature(&signature, &address, &digest).unwrap());
        assert!(!verify_signature(&signature, &address, &sha256(b"other")).unwrap());

        let err = recover_signer(&signature[..10], &digest).unwrap_err();
        assert!(matches!(err, ConsensusError::MismatchedLength { expect: 65, actual: 10 }));
    }
}

use ethers::{
    abi::{encode, Token},
    types::{Address, H256, U256},
    utils::keccak256,
};
use sha2::{Digest, Sha256};

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Lowercase hex SHA256 digest without a `0x` prefix.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data).as_bytes())
}

/// Message hash a performer signs when handing a task to the aggregator:
/// keccak256(abi.encode(string proofOfTask, bytes data, address performer, uint256 taskDefinitionId)).
pub fn task_message_hash(
    proof_of_task: &str,
    data: &[u8],
    performer: Address,
    task_definition_id: i64,
) -> H256 {
    let encoded = encode(&[
        Token::String(proof_of_task.to_string()),
        Token::Bytes(data.to_vec()),
        Token::Address(performer),
        Token::Uint(U256::from(task_definition_id.max(0) as u64)),
    ]);
    H256::from(keccak256(encoded))
}

/// `0x` followed by exactly 64 lowercase hex digits.
pub fn is_tx_hash(value: &str) -> bool {
    match value.strip_prefix("0x") {
        Some(digits) => {
            digits.len() == 64
                && digits
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn tx_hash_shape() {
        let hash = format!("{:#x}", H256::repeat_byte(0xab));
        assert!(is_tx_hash(&hash));
        assert!(!is_tx_hash("0x"));
        assert!(!is_tx_hash(&hash.to_uppercase()));
        assert!(!is_tx_hash(&hash[2..]));
    }

    #[test]
    fn task_message_hash_binds_every_field() {
        let performer = Address::repeat_byte(0x11);
        let base = task_message_hash("abc", b"cid", performer, 1);
        assert_eq!(base, task_message_hash("abc", b"cid", performer, 1));
        assert_ne!(base, task_message_hash("abd", b"cid", performer, 1));
        assert_ne!(base, task_message_hash("abc", b"cie", performer, 1));
        assert_ne!(base, task_message_hash("abc", b"cid", Address::zero(), 1));
        assert_ne!(base, task_message_hash("abc", b"cid", performer, 2));
    }
}

use starknet_crypto::poseidon_hash_many;

use crate::types::{EntityId, Felt};

/// Compute the id of the entity owning the given keys.
///
/// This is the poseidon hash of the keys, the same value the indexer reports as the hashed keys of
/// an entity, so ids derived locally line up with the ones received from queries and
/// subscriptions.
pub fn derive_entity_id(keys: &[Felt]) -> EntityId {
    EntityId::from(poseidon_hash_many(keys))
}

/// Narrows a felt to a `u32`, `None` if it doesn't fit.
pub fn felt_to_u32(felt: &Felt) -> Option<u32> {
    let bytes = felt.to_bytes_be();
    let (high, low) = bytes.split_at(28);
    if high.iter().any(|b| *b != 0) {
        return None;
    }
    Some(u32::from_be_bytes([low[0], low[1], low[2], low[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_is_deterministic() {
        let keys = [Felt::from_hex(
            "0x517ececd29116499f4a1b64b094da79ba08dfd54a3edaa316134c41f8160973",
        )
        .unwrap()];

        assert_eq!(derive_entity_id(&keys), derive_entity_id(&keys));
        assert_eq!(derive_entity_id(&keys).felt(), poseidon_hash_many(&keys));
    }

    #[test]
    fn distinct_keys_give_distinct_ids() {
        let a = derive_entity_id(&[Felt::ONE]);
        let b = derive_entity_id(&[Felt::TWO]);
        let ab = derive_entity_id(&[Felt::ONE, Felt::TWO]);
        let ba = derive_entity_id(&[Felt::TWO, Felt::ONE]);

        assert_ne!(a, b);
        assert_ne!(ab, ba);
        assert_ne!(a, ab);
    }

    #[test]
    fn narrow_felt() {
        assert_eq!(felt_to_u32(&Felt::from(42_u32)), Some(42));
        assert_eq!(felt_to_u32(&Felt::from(u32::MAX)), Some(u32::MAX));
        assert_eq!(felt_to_u32(&Felt::from(u64::from(u32::MAX) + 1)), None);
    }
}

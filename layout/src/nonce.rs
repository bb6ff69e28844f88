// SPDX-License-Identifier: MPL-2.0

//! Nonce derivation for the index layout.
//!
//! Nonces bind decoded records to the volume identity and to their
//! physical offsets. They are deterministic given their inputs and guard
//! against accidental corruption only.

use std::time::{SystemTime, UNIX_EPOCH};

use murmurhash3::murmurhash3_128;

pub(crate) const NONCE_INFO_SIZE: usize = 32;

/// Hashes arbitrary bytes down to a 64-bit value.
///
/// The hash seed and the byte range extracted from the 128-bit result are
/// fixed by the on-disk format; changing either breaks existing media.
fn hash_stuff(start: u64, data: &[u8]) -> u64 {
    let seed = (start ^ (start >> 27)) as u32;
    let hash = murmurhash3_128(data, seed);
    u64::from_le_bytes(hash[4..12].try_into().unwrap())
}

/// Generates a primary nonce from the given seed data.
pub(crate) fn generate_primary_nonce(data: &[u8]) -> u64 {
    hash_stuff(0xa1b1_e0fc, data)
}

/// Deterministically generates a secondary nonce from an existing nonce
/// and some data related to the creation of this nonce.
pub(crate) fn generate_secondary_nonce(nonce: u64, data: &[u8]) -> u64 {
    hash_stuff(nonce.wrapping_add(1), data)
}

/// Creates 32 bytes of unique seed data for a primary nonce, from the
/// current time and a pseudorandom number.
pub(crate) fn create_unique_nonce_data() -> [u8; NONCE_INFO_SIZE] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let rand: u32 = rand::random_range(1..(1u32 << 30));

    let mut buffer = [0u8; NONCE_INFO_SIZE];
    buffer[..8].copy_from_slice(&now.to_le_bytes());
    buffer[8..12].copy_from_slice(&rand.to_le_bytes());

    // Fill the rest with copies of the initial bytes.
    let mut offset = 12;
    while offset < NONCE_INFO_SIZE {
        let len = (NONCE_INFO_SIZE - offset).min(offset);
        buffer.copy_within(..len, offset);
        offset += len;
    }
    buffer
}

/// The current time in milliseconds since the epoch.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_deterministic() {
        let seed = [0xab; NONCE_INFO_SIZE];
        assert_eq!(
            generate_primary_nonce(&seed),
            generate_primary_nonce(&seed)
        );
        let parent = generate_primary_nonce(&seed);
        assert_eq!(
            generate_secondary_nonce(parent, b"payload"),
            generate_secondary_nonce(parent, b"payload")
        );
    }

    #[test]
    fn nonces_depend_on_parent_and_payload() {
        let parent = generate_primary_nonce(&[1; NONCE_INFO_SIZE]);
        assert_ne!(
            generate_secondary_nonce(parent, b"one"),
            generate_secondary_nonce(parent, b"two")
        );
        assert_ne!(
            generate_secondary_nonce(parent, b"one"),
            generate_secondary_nonce(parent + 1, b"one")
        );
    }

    #[test]
    fn nonce_data_doubles_its_seed() {
        let data = create_unique_nonce_data();
        assert_eq!(data[..12], data[12..24]);
        assert_eq!(data[..8], data[24..32]);
        assert_ne!(data[8..12], [0u8; 4]);
    }
}

//! Base64 key encoding/decoding and the `gen-key` convenience mode.
//!
//! Keys are always 16 or 32 raw bytes; any other decoded length is rejected
//! with the same "Invalid key" message the CLI surfaces on exit, matching
//! §6 of the tunnel's external interface.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

pub const KEY_LEN_128: usize = 16;
pub const KEY_LEN_256: usize = 32;

/// Generates a fresh random key of the requested size and returns its
/// base64 encoding. `bits` must be 128 or 256.
pub fn generate(bits: u32) -> anyhow::Result<String> {
    let len = match bits {
        128 => KEY_LEN_128,
        256 => KEY_LEN_256,
        other => anyhow::bail!("Invalid key size: {other} (must be 128 or 256)"),
    };

    let mut key = vec![0u8; len];
    rand::rng().fill_bytes(&mut key);
    Ok(STANDARD.encode(key))
}

/// Decodes a base64-encoded key, rejecting anything that isn't exactly 16
/// or 32 raw bytes. The error message is deliberately generic ("Invalid
/// key") so it doesn't leak which check failed.
pub fn decode(encoded: &str) -> anyhow::Result<Vec<u8>> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|_| anyhow::anyhow!("Invalid key"))?;

    match raw.len() {
        KEY_LEN_128 | KEY_LEN_256 => Ok(raw),
        _ => anyhow::bail!("Invalid key"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_decodes_back_to_requested_size() {
        for bits in [128, 256] {
            let encoded = generate(bits).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded.len(), bits as usize / 8);
        }
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(decode("not valid base64!!").is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        let short = STANDARD.encode([0u8; 8]);
        assert!(decode(&short).is_err());
    }

    #[test]
    fn rejects_bad_bit_size() {
        assert!(generate(192).is_err());
    }
}

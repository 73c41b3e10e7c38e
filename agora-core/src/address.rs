//! Base32 address encoding
//!
//! Keys render to human strings as base32 of
//! `version_byte || key || CRC16-XMODEM(version_byte || key)`. Public keys
//! begin with 'G', seeds with 'S'; the checksum is verified on decode.

use crate::CoreError;

/// Version byte for public account addresses ('G').
pub const VERSION_ACCOUNT_ID: u8 = 6 << 3;

/// Version byte for secret seeds ('S').
pub const VERSION_SEED: u8 = 18 << 3;

const ALPHABET: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// CRC16-XMODEM: polynomial 0x1021, MSB-first, initial value 0.
fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Render a 32-byte key under the given version byte.
pub fn encode(version: u8, key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(35);
    payload.push(version);
    payload.extend_from_slice(key);
    let crc = crc16_xmodem(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    base32::encode(ALPHABET, &payload)
}

/// Parse an address string, checking length, version byte and checksum.
pub fn decode(version: u8, s: &str) -> Result<[u8; 32], CoreError> {
    let payload = base32::decode(ALPHABET, s)
        .ok_or_else(|| CoreError::MalformedAddress("not valid base32".to_string()))?;
    if payload.len() != 35 {
        return Err(CoreError::MalformedAddress(format!(
            "expected 35 decoded bytes, got {}",
            payload.len()
        )));
    }
    if payload[0] != version {
        return Err(CoreError::MalformedAddress(format!(
            "wrong version byte 0x{:02x}",
            payload[0]
        )));
    }
    let expected = crc16_xmodem(&payload[..33]);
    let actual = u16::from_le_bytes([payload[33], payload[34]]);
    if expected != actual {
        return Err(CoreError::MalformedAddress("checksum mismatch".to_string()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[1..33]);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "GDD5RFGBIUAFCOXQA246BOUPHCK7ZL2NSHDU7DVAPNPTJJKVPJMNLQFW";
    const SEED: &str = "SBBUWIMSX5VL4KVFKY44GF6Q6R5LS2Z5B7CTAZBNCNPLS4UKFVDXC7TQ";

    #[test]
    fn test_address_round_trip() {
        let key = decode(VERSION_ACCOUNT_ID, ADDRESS).unwrap();
        assert_eq!(encode(VERSION_ACCOUNT_ID, &key), ADDRESS);
    }

    #[test]
    fn test_seed_round_trip() {
        let key = decode(VERSION_SEED, SEED).unwrap();
        assert_eq!(encode(VERSION_SEED, &key), SEED);
    }

    #[test]
    fn test_first_character_tracks_version() {
        let key = [7u8; 32];
        assert!(encode(VERSION_ACCOUNT_ID, &key).starts_with('G'));
        assert!(encode(VERSION_SEED, &key).starts_with('S'));
        assert_eq!(encode(VERSION_ACCOUNT_ID, &key).len(), 56);
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut s = ADDRESS.to_string();
        // Swap the last character for a different alphabet member.
        let last = s.pop().unwrap();
        s.push(if last == 'A' { 'B' } else { 'A' });
        assert!(matches!(
            decode(VERSION_ACCOUNT_ID, &s),
            Err(CoreError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        assert!(matches!(
            decode(VERSION_SEED, ADDRESS),
            Err(CoreError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            decode(VERSION_ACCOUNT_ID, "GAAA"),
            Err(CoreError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_crc16_xmodem_reference_vector() {
        // Standard XMODEM check value for "123456789".
        assert_eq!(crc16_xmodem(b"123456789"), 0x31c3);
    }
}

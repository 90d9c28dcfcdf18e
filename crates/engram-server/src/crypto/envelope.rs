// crates/engram-server/src/crypto/envelope.rs
// MSEH envelope: the bit-exact wire format for encrypted records
//
// Layout: 4-byte big-endian magic 0x4D534548 ("MSEH"), then a
// varint-length-prefixed protobuf header {version, provider_id, iv},
// then the raw ciphertext. Records without the magic are legacy
// plaintext and pass through untouched.

use prost::Message;

use crate::error::{EngramError, Result};

/// "MSEH", 0x4D534548 big-endian.
pub const MAGIC: [u8; 4] = [0x4D, 0x53, 0x45, 0x48];

pub const ENVELOPE_VERSION: u32 = 1;

/// The protobuf header between the magic and the ciphertext.
#[derive(Clone, PartialEq, Message)]
pub struct EnvelopeHeader {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub provider_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub iv: Vec<u8>,
}

/// Whether a record starts with the envelope magic.
pub fn has_magic(record: &[u8]) -> bool {
    record.len() >= MAGIC.len() && record[..MAGIC.len()] == MAGIC
}

/// Assemble a full envelope record.
pub fn seal(provider_id: &str, iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let header = EnvelopeHeader {
        version: ENVELOPE_VERSION,
        provider_id: provider_id.to_string(),
        iv: iv.to_vec(),
    };
    // encode_length_delimited_to_vec writes the varint prefix itself
    let encoded = header.encode_length_delimited_to_vec();
    let mut out = Vec::with_capacity(MAGIC.len() + encoded.len() + ciphertext.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&encoded);
    out.extend_from_slice(ciphertext);
    out
}

/// Split a record into header and ciphertext.
///
/// Returns `None` for legacy plaintext (no magic). A record that carries
/// the magic but fails to parse is a `DecryptionFailed`, not plaintext.
pub fn parse(record: &[u8]) -> Result<Option<(EnvelopeHeader, &[u8])>> {
    if !has_magic(record) {
        return Ok(None);
    }
    let mut buf = &record[MAGIC.len()..];
    let header = EnvelopeHeader::decode_length_delimited(&mut buf)
        .map_err(|e| EngramError::DecryptionFailed(format!("malformed envelope header: {e}")))?;
    Ok(Some((header, buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_bytes_are_mseh() {
        assert_eq!(&MAGIC, b"MSEH");
        assert_eq!(u32::from_be_bytes(MAGIC), 0x4D53_4548);
    }

    #[test]
    fn test_seal_parse_round_trip() {
        let iv = [7u8; 12];
        let record = seal("dek", &iv, b"ciphertext-bytes");
        assert!(has_magic(&record));

        let (header, ct) = parse(&record).unwrap().unwrap();
        assert_eq!(header.version, ENVELOPE_VERSION);
        assert_eq!(header.provider_id, "dek");
        assert_eq!(header.iv, iv);
        assert_eq!(ct, b"ciphertext-bytes");
    }

    #[test]
    fn test_plaintext_passthrough() {
        let record = b"just some plaintext";
        assert!(!has_magic(record));
        assert!(parse(record).unwrap().is_none());
    }

    #[test]
    fn test_magic_with_garbage_header_fails() {
        let mut record = MAGIC.to_vec();
        record.extend_from_slice(&[0xFF; 8]);
        assert!(matches!(
            parse(&record),
            Err(EngramError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_empty_ciphertext() {
        let record = seal("plain-test", &[], b"");
        let (header, ct) = parse(&record).unwrap().unwrap();
        assert!(header.iv.is_empty());
        assert!(ct.is_empty());
    }
}

//! Small helpers shared across the crate.

use crate::error::{Error, Result};
use crate::{Digest, DIGEST_SIZE};

pub fn digest_to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

pub fn hex_to_digest(hex_str: &str) -> Result<Digest> {
    let bytes = hex::decode(hex_str)
        .map_err(|err| Error::Usage(format!("invalid digest '{}' - {}", hex_str, err)))?;
    if bytes.len() != DIGEST_SIZE {
        return Err(Error::Usage(format!(
            "invalid digest '{}' - expected {} bytes, got {}",
            hex_str,
            DIGEST_SIZE,
            bytes.len()
        )));
    }
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&bytes);
    Ok(digest)
}

/// Split a textual snapshot reference into its identifier prefix and an
/// optional path. `HEX:/some/path` refers to a path inside the snapshot,
/// a bare `HEX` to the snapshot root.
pub fn parse_snapshot_ref(reference: &str) -> (&str, &str) {
    match reference.find(':') {
        Some(position) => (&reference[..position], &reference[position + 1..]),
        None => (reference, "/"),
    }
}

/// Shannon entropy of a byte histogram, in bits per byte.
pub fn histogram_entropy(counts: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let mut entropy = 0.0;
    for &count in counts.iter() {
        if count == 0 {
            continue;
        }
        let p = count as f64 / total as f64;
        entropy -= p * p.log2();
    }
    entropy
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let digest = [0xabu8; 32];
        let hex_str = digest_to_hex(&digest);
        assert_eq!(hex_str.len(), 64);
        assert_eq!(hex_to_digest(&hex_str).unwrap(), digest);
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(hex_to_digest("zz").is_err());
        assert!(hex_to_digest("abcd").is_err());
    }

    #[test]
    fn test_parse_snapshot_ref() {
        assert_eq!(
            parse_snapshot_ref("deadbeef:/etc/passwd"),
            ("deadbeef", "/etc/passwd")
        );
        assert_eq!(parse_snapshot_ref("deadbeef"), ("deadbeef", "/"));
    }

    #[test]
    fn test_entropy_bounds() {
        let mut counts = [0u64; 256];
        counts[0] = 100;
        assert_eq!(histogram_entropy(&counts, 100), 0.0);

        let uniform = [4u64; 256];
        let entropy = histogram_entropy(&uniform, 1024);
        assert!((entropy - 8.0).abs() < 1e-9);
    }
}

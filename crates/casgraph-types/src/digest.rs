//! Type-system fingerprints.
//!
//! Binary CAS files record the fingerprint of the type system they were
//! written with, and readers refuse to decode against a different one.
//!
//! - algorithm: **FNV-1a 64-bit**
//! - input: a canonical rendering of every type and declared feature, in
//!   type-code order
//! - text form: `"fnv1a64:<16 lowercase hex digits>"`
//!
//! Not a security primitive; it only has to tell type systems apart.

/// Prefix used when a fingerprint is rendered as text.
pub const FINGERPRINT_PREFIX: &str = "fnv1a64:";

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001b3;

/// Incremental FNV-1a 64-bit hasher.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64(u64);

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Fnv1a64 {
    pub fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn add_str(&mut self, s: &str) {
        self.add_bytes(s.as_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = Fnv1a64::new();
    hash.add_bytes(bytes);
    hash.finish()
}

pub fn format_fingerprint(fingerprint: u64) -> String {
    format!("{FINGERPRINT_PREFIX}{fingerprint:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn formatted_fingerprint_has_prefix_and_width() {
        let s = format_fingerprint(fnv1a64(b"cas.TOP"));
        assert!(s.starts_with(FINGERPRINT_PREFIX));
        assert_eq!(s.len(), FINGERPRINT_PREFIX.len() + 16);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hash = Fnv1a64::new();
        hash.add_str("type=");
        hash.add_str("Foo");
        assert_eq!(hash.finish(), fnv1a64(b"type=Foo"));
    }
}

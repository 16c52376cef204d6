//! Deterministic marker-id derivation.
//!
//! `markerId = first12(fnv1a(base) ++ fnv1a(reverse(base)))`. Hashing the
//! string both forwards and backwards before truncating to 12 hex chars
//! guards against the kind of accidental truncation collision a plain
//! single-direction hash would be prone to at only 48 bits of output.

/// FNV-1a, 32-bit variant.
fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Derive the 12-hex-char marker id for a writeback `base` string.
pub fn derive_marker_id(base: &str) -> String {
    let reversed: String = base.chars().rev().collect();
    let forward = fnv1a(base.as_bytes());
    let backward = fnv1a(reversed.as_bytes());
    let combined = format!("{forward:08x}{backward:08x}");
    combined[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_id_is_twelve_lowercase_hex_chars() {
        let id = derive_marker_id("escalation|o/r|42|need-guidance|0");
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn marker_id_is_deterministic() {
        let base = "watchdog|o/r|7|stuck|1";
        assert_eq!(derive_marker_id(base), derive_marker_id(base));
    }

    #[test]
    fn different_bases_produce_different_ids() {
        assert_ne!(
            derive_marker_id("escalation|o/r|1|a|0"),
            derive_marker_id("escalation|o/r|2|a|0")
        );
    }
}

//! Stable hashing for identities and addresses.
//!
//! `DefaultHasher` is not stable across Rust versions, so anything that must
//! map the same input to the same output across runs (display colors,
//! discovery dedup keys) goes through FNV-1a instead.

/// Palette used for node display colors.
pub const PALETTE: [&str; 10] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948", "#b07aa1", "#ff9da7",
    "#9c755f", "#bab0ac",
];

/// FNV-1a hash of a string.
pub fn fnv1a_hash(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Display color for an identity. Cosmetic only.
pub fn display_color(identity: &str) -> &'static str {
    PALETTE[(fnv1a_hash(identity) % PALETTE.len() as u64) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        // Reference values for 64-bit FNV-1a
        assert_eq!(fnv1a_hash(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_fnv1a_distinguishes_inputs() {
        assert_ne!(fnv1a_hash("tcp/10.0.0.1:7447"), fnv1a_hash("tcp/10.0.0.2:7447"));
    }

    #[test]
    fn test_display_color_is_stable() {
        let first = display_color("node-a");
        for _ in 0..10 {
            assert_eq!(display_color("node-a"), first);
        }
        assert!(PALETTE.contains(&first));
    }
}

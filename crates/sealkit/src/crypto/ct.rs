//! Constant-time comparison for secret-derived byte strings.

/// Compare two byte slices without branching on their contents.
///
/// Lengths are compared first (they are public); the byte comparison then
/// always visits every byte and folds the differences together.
#[inline(never)]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    std::hint::black_box(diff) == 0
}

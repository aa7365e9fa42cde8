//! N-gram decomposition for the substring index.
//!
//! Indexed text is folded and cut into overlapping trigrams. Strings
//! shorter than the gram width contribute their full prefixes instead
//! (length 1 and 2) so one- and two-character names stay reachable.

use ahash::AHashSet;

pub const GRAM_LEN: usize = 3;

/// All grams of an already-folded text.
pub fn grams_of(text: &str) -> AHashSet<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut grams = AHashSet::new();
    if chars.len() < GRAM_LEN {
        for end in 1..=chars.len() {
            grams.insert(chars[..end].iter().collect());
        }
        return grams;
    }
    for window in chars.windows(GRAM_LEN) {
        grams.insert(window.iter().collect());
    }
    grams
}

/// Grams to intersect for a query substring. Returns `None` when the
/// pattern is too short to seed from the gram index and the caller must
/// scan instead.
pub fn query_grams(pattern: &str) -> Option<Vec<String>> {
    let chars: Vec<char> = pattern.chars().collect();
    if chars.len() < GRAM_LEN {
        return None;
    }
    let mut grams: Vec<String> = chars
        .windows(GRAM_LEN)
        .map(|w| w.iter().collect())
        .collect();
    grams.sort();
    grams.dedup();
    Some(grams)
}

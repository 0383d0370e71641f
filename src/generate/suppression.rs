//! Script-based token suppression
//!
//! Without an active delta correction the model answers in English only,
//! so tokens that render CJK ideographs, Hangul or kana are removed from
//! the candidate set.

use std::ops::RangeInclusive;

use crate::tokenizer::Vocabulary;

const SUPPRESSED_RANGES: [RangeInclusive<u32>; 8] = [
    0x4E00..=0x9FFF,   // CJK unified ideographs
    0x3400..=0x4DBF,   // extension A
    0x20000..=0x2EBEF, // extensions B-F
    0xF900..=0xFAFF,   // compatibility ideographs
    0x2E80..=0x2EFF,   // radicals supplement
    0xAC00..=0xD7AF,   // Hangul syllables
    0x3040..=0x309F,   // Hiragana
    0x30A0..=0x30FF,   // Katakana
];

/// True if `text` contains a character from a suppressed script
#[must_use]
pub fn contains_cjk(text: &str) -> bool {
    text.chars()
        .any(|c| SUPPRESSED_RANGES.iter().any(|r| r.contains(&(c as u32))))
}

/// Ids of every token whose decoded text contains a suppressed script
///
/// Tokens holding only part of a multi-byte character decode to the
/// replacement character and are not matched.
#[must_use]
pub fn script_suppression_set(vocab: &Vocabulary) -> Vec<u32> {
    (0..vocab.len() as u32)
        .filter(|&id| contains_cjk(&vocab.decode_token_lossy(id)))
        .collect()
}

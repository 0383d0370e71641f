//! Property-based tests for the byte-level BPE vocabulary
//!
//! With every byte present as a token, encoding is lossless whatever merges
//! exist.

use deltavox::tokenizer::{Vocabulary, TOKEN_TYPE_CONTROL};
use proptest::prelude::*;

/// GPT-2 style printable character for each byte
fn byte_tokens() -> Vec<String> {
    let mut extra = 0u32;
    (0u32..256)
        .map(|b| {
            let printable =
                (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
            let code = if printable {
                b
            } else {
                extra += 1;
                255 + extra
            };
            char::from_u32(code).unwrap().to_string()
        })
        .collect()
}

fn vocab() -> Vocabulary {
    let mut tokens = byte_tokens();
    let merged = ["th", "the", "Ġt", "Ġthe", "er", "in", "ing", "<|im_end|>"];
    tokens.extend(merged.iter().map(|s| s.to_string()));
    let merges = ["t h", "th e", "Ġ t", "Ġt he", "e r", "i n", "in g"];
    let mut types = vec![1i32; tokens.len()];
    *types.last_mut().unwrap() = TOKEN_TYPE_CONTROL;
    Vocabulary::from_parts(&tokens, &merges, Some(&types)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn test_decode_inverts_encode(text in "\\PC{0,64}") {
        let vocab = vocab();
        let ids = vocab.encode(&text, false);
        prop_assert_eq!(vocab.decode(&ids), text);
    }

    #[test]
    fn test_ids_within_vocabulary(text in "[a-z \\n.,!?]{0,80}") {
        let vocab = vocab();
        let len = vocab.len() as u32;
        prop_assert!(vocab.encode(&text, false).iter().all(|&id| id < len));
    }

    /// Merges never produce more ids than bytes
    #[test]
    fn test_merging_never_expands(text in "[a-z ]{1,80}") {
        let vocab = vocab();
        prop_assert!(vocab.encode(&text, false).len() <= text.len());
    }

    /// A literal control token splits the text without being merged
    #[test]
    fn test_control_token_kept_whole(left in "[a-z]{0,10}", right in "[a-z]{0,10}") {
        let vocab = vocab();
        let end = vocab.find_special_token("<|im_end|>").unwrap();
        let ids = vocab.encode(&format!("{left}<|im_end|>{right}"), false);
        prop_assert_eq!(ids.iter().filter(|&&id| id == end).count(), 1);
        prop_assert_eq!(vocab.decode(&ids), format!("{left}<|im_end|>{right}"));
    }
}

#[test]
fn test_common_words_use_merged_tokens() {
    let vocab = vocab();
    let ids = vocab.encode(" the", false);
    assert_eq!(ids.len(), 1);
    assert_eq!(vocab.token(ids[0]), Some("Ġthe"));
}

//! Byte-level BPE tokenizer built from container metadata
//!
//! Tokens are stored GPT-2 style: every byte maps to a printable unicode
//! character, so `"Ġhello"` is the bytes `b" hello"`. The vocabulary decodes
//! each token to its literal bytes once at build time.
//!
//! ## Example
//!
//! ```
//! use deltavox::tokenizer::Vocabulary;
//!
//! let tokens = ["h", "e", "l", "o", "he", "ll", "hell", "hello"];
//! let merges = ["h e", "l l", "he ll", "hell o"];
//! let vocab = Vocabulary::from_parts(&tokens, &merges, None).unwrap();
//! assert_eq!(vocab.encode("hello", false), vec![7]);
//! assert_eq!(vocab.decode(&[7]), "hello");
//! ```

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::debug;

use crate::error::{DeltavoxError, Result};
use crate::gguf::GGUFModel;

/// `tokenizer.ggml.token_type` value for control tokens
pub const TOKEN_TYPE_CONTROL: i32 = 3;
/// `tokenizer.ggml.token_type` value for user-defined tokens
pub const TOKEN_TYPE_USER_DEFINED: i32 = 4;

/// Names tried, in order, for the end-of-turn marker
const END_OF_TURN_NAMES: [&str; 3] = ["<|im_end|>", "<|eot_id|>", "<end_of_turn>"];

/// GPT-2 byte → printable character table
fn byte_to_char_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut extra = 0u32;
    for (b, slot) in table.iter_mut().enumerate() {
        let printable =
            (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
        let code = if printable {
            b as u32
        } else {
            extra += 1;
            255 + extra
        };
        *slot = char::from_u32(code).unwrap_or('\u{FFFD}');
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Letter,
    Digit,
    Space,
    Other,
}

fn classify(c: char) -> CharClass {
    if c.is_alphabetic() {
        CharClass::Letter
    } else if c.is_numeric() {
        CharClass::Digit
    } else if c.is_whitespace() {
        CharClass::Space
    } else {
        CharClass::Other
    }
}

/// Split a segment into pre-tokenization pieces
///
/// Runs of one character class become a piece; a single space directly
/// before a non-space run is attached to that run.
fn pre_tokenize(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let end_of = |i: usize| chars.get(i).map_or(text.len(), |&(b, _)| b);
    let mut pieces = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let start = i;
        let (_, c) = chars[i];
        if c == ' ' && chars.get(i + 1).is_some_and(|&(_, n)| !n.is_whitespace()) {
            i += 1;
        }
        let class = classify(chars[i].1);
        let mut j = i + 1;
        while j < chars.len() && classify(chars[j].1) == class {
            j += 1;
        }
        // leave a trailing space for the next word
        if class == CharClass::Space
            && j < chars.len()
            && j - i > 1
            && chars[j - 1].1 == ' '
        {
            j -= 1;
        }
        pieces.push(&text[end_of(start)..end_of(j)]);
        i = j;
    }
    pieces
}

/// Bidirectional id ↔ bytes mapping plus merge priorities
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Token strings in GPT-2 encoded form, index = id
    tokens: Vec<String>,
    /// Literal bytes per id
    token_bytes: Vec<Vec<u8>>,
    token_to_id: HashMap<String, u32>,
    /// `"left right"` → rank
    merge_ranks: HashMap<String, usize>,
    /// Control and user-defined tokens, longest first
    special: Vec<(String, u32)>,
    byte_to_char: [char; 256],
    bos_id: Option<u32>,
    eos_id: Option<u32>,
}

impl Vocabulary {
    /// Build from `tokenizer.ggml.*` metadata
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Parse`] if the token list is missing or empty.
    pub fn from_gguf(model: &GGUFModel) -> Result<Self> {
        let tokens = model
            .get_string_array("tokenizer.ggml.tokens")
            .ok_or_else(|| DeltavoxError::parse("tokenizer", "missing tokenizer.ggml.tokens"))?;
        let merges = model
            .get_string_array("tokenizer.ggml.merges")
            .unwrap_or_default();
        let types = model.get_i32_array("tokenizer.ggml.token_type");

        let mut vocab = Self::from_parts(&tokens, &merges, types.as_deref())?;
        vocab.bos_id = model.get_u32("tokenizer.ggml.bos_token_id");
        vocab.eos_id = model.get_u32("tokenizer.ggml.eos_token_id");
        debug!(
            tokens = vocab.len(),
            merges = vocab.merge_ranks.len(),
            special = vocab.special.len(),
            bos = ?vocab.bos_id,
            eos = ?vocab.eos_id,
            "vocabulary built"
        );
        Ok(vocab)
    }

    /// Build from token strings, `"left right"` merge strings and optional
    /// token types
    ///
    /// # Errors
    ///
    /// Returns [`DeltavoxError::Parse`] if `tokens` is empty.
    pub fn from_parts<S: AsRef<str>, M: AsRef<str>>(
        tokens: &[S],
        merges: &[M],
        token_types: Option<&[i32]>,
    ) -> Result<Self> {
        if tokens.is_empty() {
            return Err(DeltavoxError::parse("tokenizer", "vocabulary is empty"));
        }

        let byte_to_char = byte_to_char_table();
        let char_to_byte: HashMap<char, u8> = byte_to_char
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let mut token_to_id = HashMap::with_capacity(tokens.len());
        let mut token_bytes = Vec::with_capacity(tokens.len());
        let mut special = Vec::new();
        for (id, token) in tokens.iter().enumerate() {
            let token = token.as_ref();
            let id = id as u32;
            // first occurrence wins on duplicates
            token_to_id.entry(token.to_string()).or_insert(id);

            let is_special = token_types
                .and_then(|t| t.get(id as usize))
                .is_some_and(|&t| t == TOKEN_TYPE_CONTROL || t == TOKEN_TYPE_USER_DEFINED);
            if is_special {
                if !token.is_empty() {
                    special.push((token.to_string(), id));
                }
                token_bytes.push(token.as_bytes().to_vec());
                continue;
            }

            let mut bytes = Vec::with_capacity(token.len());
            for c in token.chars() {
                match char_to_byte.get(&c) {
                    Some(&b) => bytes.push(b),
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    },
                }
            }
            token_bytes.push(bytes);
        }
        special.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));

        let mut merge_ranks = HashMap::with_capacity(merges.len());
        for (rank, merge) in merges.iter().enumerate() {
            merge_ranks.entry(merge.as_ref().to_string()).or_insert(rank);
        }

        Ok(Self {
            tokens: tokens.iter().map(|t| t.as_ref().to_string()).collect(),
            token_bytes,
            token_to_id,
            merge_ranks,
            special,
            byte_to_char,
            bos_id: None,
            eos_id: None,
        })
    }

    /// Number of tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false for a built vocabulary
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Beginning-of-sequence id, if declared
    #[must_use]
    pub fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }

    /// End-of-sequence id, if declared
    #[must_use]
    pub fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    /// Override the declared end-of-sequence id
    pub fn set_eos_id(&mut self, id: Option<u32>) {
        self.eos_id = id;
    }

    /// Id of a token given by its exact stored string
    #[must_use]
    pub fn find_special_token(&self, name: &str) -> Option<u32> {
        self.token_to_id.get(name).copied()
    }

    /// End-of-turn marker id (`<|im_end|>`, `<|eot_id|>` or `<end_of_turn>`)
    #[must_use]
    pub fn end_of_turn_id(&self) -> Option<u32> {
        END_OF_TURN_NAMES
            .iter()
            .find_map(|name| self.find_special_token(name))
    }

    /// Stored (encoded) string of a token
    #[must_use]
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Literal bytes of one token; empty for an unknown id
    #[must_use]
    pub fn decode_token(&self, id: u32) -> &[u8] {
        self.token_bytes.get(id as usize).map_or(&[], Vec::as_slice)
    }

    /// One token as text, replacing invalid UTF-8
    #[must_use]
    pub fn decode_token_lossy(&self, id: u32) -> Cow<'_, str> {
        String::from_utf8_lossy(self.decode_token(id))
    }

    /// Concatenate token bytes and convert to text once
    ///
    /// Multi-byte characters split across tokens are reassembled.
    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .flat_map(|&id| self.decode_token(id).iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Encode text to token ids
    ///
    /// With `add_bos` the declared beginning-of-sequence id is prepended.
    /// Control and user-defined tokens written literally in `text` are
    /// emitted as single ids.
    #[must_use]
    pub fn encode(&self, text: &str, add_bos: bool) -> Vec<u32> {
        let mut ids = Vec::new();
        if add_bos {
            if let Some(bos) = self.bos_id {
                ids.push(bos);
            }
        }

        let mut segment_start = 0;
        let mut i = 0;
        while i < text.len() {
            let rest = &text[i..];
            let special = self
                .special
                .iter()
                .find(|(s, _)| rest.starts_with(s.as_str()));
            if let Some((name, id)) = special {
                self.encode_segment(&text[segment_start..i], &mut ids);
                ids.push(*id);
                i += name.len();
                segment_start = i;
            } else {
                i += rest.chars().next().map_or(1, char::len_utf8);
            }
        }
        self.encode_segment(&text[segment_start..], &mut ids);
        ids
    }

    fn encode_segment(&self, text: &str, ids: &mut Vec<u32>) {
        for piece in pre_tokenize(text) {
            self.encode_word(piece, ids);
        }
    }

    /// Greedy lowest-rank pair merging over one pre-tokenized piece
    fn encode_word(&self, word: &str, ids: &mut Vec<u32>) {
        let encoded: String = word.bytes().map(|b| self.byte_to_char[b as usize]).collect();
        if let Some(&id) = self.token_to_id.get(&encoded) {
            ids.push(id);
            return;
        }

        // symbols are byte ranges of `encoded`
        let mut symbols: Vec<(usize, usize)> = encoded
            .char_indices()
            .map(|(i, c)| (i, i + c.len_utf8()))
            .collect();
        let mut key = String::new();

        loop {
            let mut best: Option<(usize, usize)> = None;
            for (pos, pair) in symbols.windows(2).enumerate() {
                key.clear();
                key.push_str(&encoded[pair[0].0..pair[0].1]);
                key.push(' ');
                key.push_str(&encoded[pair[1].0..pair[1].1]);
                if let Some(&rank) = self.merge_ranks.get(key.as_str()) {
                    if best.is_none_or(|(r, _)| rank < r) {
                        best = Some((rank, pos));
                    }
                }
            }
            let Some((_, pos)) = best else { break };
            let merged = (symbols[pos].0, symbols[pos + 1].1);
            symbols[pos] = merged;
            symbols.remove(pos + 1);
        }

        for (start, end) in symbols {
            let symbol = &encoded[start..end];
            if let Some(&id) = self.token_to_id.get(symbol) {
                ids.push(id);
                continue;
            }
            // byte fallback
            for c in symbol.chars() {
                let mut buf = [0u8; 4];
                match self.token_to_id.get(&*c.encode_utf8(&mut buf)) {
                    Some(&id) => ids.push(id),
                    None => debug!(symbol = %c, "no token for byte, dropped"),
                }
            }
        }
    }
}

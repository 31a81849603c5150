use super::{TokenCount, TokenType, TokenizeOptions, Vocab};
use crate::core::{InferenceError, Result, TokenId};

/// Longest piece a single token may print.
pub const MAX_PIECE_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub bytes: Vec<u8>,
    /// Control or user-defined marker rather than ordinary text.
    pub special: bool,
}

/// Text <-> token conversion against a model's vocabulary.
pub struct TokenizerAdapter<'a> {
    vocab: &'a dyn Vocab,
}

impl<'a> TokenizerAdapter<'a> {
    pub fn new(vocab: &'a dyn Vocab) -> Self {
        Self { vocab }
    }

    /// Sizes the output with a first tokenizer pass, then fills exactly that
    /// many slots with a second one.
    pub fn encode(&self, text: &str, options: &TokenizeOptions) -> Result<Vec<TokenId>> {
        let required = match self.vocab.tokenize_into(text, options, &mut [])? {
            TokenCount::Required(n) | TokenCount::Written(n) => n,
        };
        if required == 0 {
            return Err(InferenceError::Tokenization(
                "input produced no tokens".to_string(),
            ));
        }

        let mut tokens = vec![TokenId(0); required];
        match self.vocab.tokenize_into(text, options, &mut tokens)? {
            TokenCount::Written(n) if n == required => Ok(tokens),
            TokenCount::Written(n) | TokenCount::Required(n) => {
                Err(InferenceError::Tokenization(format!(
                    "tokenizer reported {required} tokens, then produced {n}"
                )))
            }
        }
    }

    /// Encodes a prompt that has to fit `capacity` tokens. Text longer than
    /// `capacity` full-size pieces cannot fit and is refused before any
    /// tokenizer pass runs.
    pub fn encode_prompt(
        &self,
        text: &str,
        options: &TokenizeOptions,
        capacity: usize,
    ) -> Result<Vec<TokenId>> {
        let limit = capacity.saturating_mul(MAX_PIECE_BYTES);
        if text.len() > limit {
            return Err(InferenceError::Tokenization(format!(
                "prompt too large: {} bytes, at most {limit}",
                text.len()
            )));
        }
        self.encode(text, options)
    }

    pub fn decode(&self, token: TokenId, special: bool) -> Result<Piece> {
        let mut bytes = self.vocab.token_to_piece(token, special)?;

        if bytes.len() > MAX_PIECE_BYTES {
            debug_assert!(
                bytes.len() <= MAX_PIECE_BYTES,
                "token {} renders {} bytes, more than {MAX_PIECE_BYTES}",
                token.0,
                bytes.len()
            );
            tracing::warn!(
                token = token.0,
                len = bytes.len(),
                "token piece exceeds {MAX_PIECE_BYTES} bytes, truncating"
            );
            bytes.truncate(MAX_PIECE_BYTES);
        }

        let special = matches!(
            self.vocab.token_type(token),
            Some(TokenType::Control | TokenType::UserDefined)
        );
        Ok(Piece { bytes, special })
    }

    pub fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.vocab.is_eog(token)
    }
}

/// Reassembles UTF-8 text from per-token byte pieces.
///
/// A character split across tokens is held back until its last byte arrives.
/// Invalid sequences turn into U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    // from_utf8 already validated this prefix
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flushes an incomplete trailing sequence.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

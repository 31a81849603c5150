use super::TokenType;
use crate::core::{Result, TokenId};

/// Vocabulary-level text conversion owned by a loaded model.
pub trait Vocab: Send + Sync {
    fn n_tokens(&self) -> usize;

    /// Tokenizes `text` into `out`.
    ///
    /// When `out` is too small nothing useful is written and
    /// [`TokenCount::Required`] reports the length needed, so callers size
    /// their buffer with a first pass and fill it with a second.
    fn tokenize_into(
        &self,
        text: &str,
        options: &TokenizeOptions,
        out: &mut [TokenId],
    ) -> Result<TokenCount>;

    /// Raw bytes printed for `token`. Control tokens render as their text
    /// only when `special` is set.
    fn token_to_piece(&self, token: TokenId, special: bool) -> Result<Vec<u8>>;

    fn token_type(&self, token: TokenId) -> Option<TokenType>;

    fn is_eog(&self, token: TokenId) -> bool;

    fn bos_token(&self) -> Option<TokenId>;
    fn eos_token(&self) -> Option<TokenId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCount {
    Written(usize),
    Required(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizeOptions {
    /// Add BOS/EOS as the vocabulary prescribes.
    pub add_special: bool,
    /// Map literal control-token text in the input to the control token.
    pub parse_special: bool,
}

impl Default for TokenizeOptions {
    fn default() -> Self {
        Self {
            add_special: true,
            parse_special: true,
        }
    }
}

impl TokenizeOptions {
    pub fn plain() -> Self {
        Self {
            add_special: false,
            parse_special: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenizerKind {
    Bpe,
    SentencePiece,
}

impl TokenizerKind {
    /// Maps the `tokenizer.ggml.model` metadata value.
    pub fn from_gguf(model: &str) -> Option<Self> {
        match model.to_lowercase().as_str() {
            "llama" | "spm" | "sentencepiece" => Some(Self::SentencePiece),
            "gpt2" | "bpe" => Some(Self::Bpe),
            _ => None,
        }
    }
}

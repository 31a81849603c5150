pub mod adapter;
pub mod bpe;
mod merge;
pub mod sentencepiece;
pub mod traits;

pub use adapter::{Piece, TokenizerAdapter, Utf8Stream, MAX_PIECE_BYTES};
pub use bpe::BpeTokenizer;
pub use sentencepiece::SentencePieceTokenizer;
pub use traits::{TokenCount, TokenizeOptions, TokenizerKind, Vocab};

use crate::core::{InferenceError, Result, TokenId};
use std::collections::HashSet;

/// Control-token texts that end generation even when the vocabulary does not
/// flag them through an explicit id.
const EOG_MARKERS: &[&str] = &[
    "<|eot_id|>",
    "<|end_of_text|>",
    "<end_of_turn>",
    "<|im_end|>",
    "<|endoftext|>",
    "<|end|>",
    "</s>",
];

pub fn create_vocab(kind: TokenizerKind, vocab: Vocabulary) -> Result<Box<dyn Vocab>> {
    Ok(match kind {
        TokenizerKind::Bpe => Box::new(BpeTokenizer::new(vocab)?),
        TokenizerKind::SentencePiece => Box::new(SentencePieceTokenizer::new(vocab)),
    })
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub scores: Vec<f32>,
    pub types: Vec<TokenType>,
    pub merges: Vec<String>,
    pub bos_token: Option<TokenId>,
    pub eos_token: Option<TokenId>,
    pub eot_token: Option<TokenId>,
    pub eom_token: Option<TokenId>,
    pub pad_token: Option<TokenId>,
    pub unk_token: Option<TokenId>,
    pub add_bos: bool,
    pub add_eos: bool,
    pub add_space_prefix: bool,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        let len = tokens.len();
        Self {
            tokens,
            scores: vec![0.0; len],
            types: vec![TokenType::Normal; len],
            merges: Vec::new(),
            bos_token: None,
            eos_token: None,
            eot_token: None,
            eom_token: None,
            pad_token: None,
            unk_token: None,
            add_bos: false,
            add_eos: false,
            add_space_prefix: true,
        }
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id.index()?).map(|s| s.as_str())
    }

    pub fn token_type(&self, id: TokenId) -> Option<TokenType> {
        let index = id.index()?;
        if index >= self.tokens.len() {
            return None;
        }
        Some(self.types.get(index).copied().unwrap_or(TokenType::Normal))
    }

    pub fn score(&self, id: TokenId) -> f32 {
        id.index()
            .and_then(|i| self.scores.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set_type(&mut self, id: TokenId, kind: TokenType) {
        if let Some(index) = id.index().filter(|&i| i < self.tokens.len()) {
            self.types.resize(self.tokens.len(), TokenType::Normal);
            self.types[index] = kind;
        }
    }

    pub fn eog_tokens(&self) -> HashSet<TokenId> {
        let mut eog: HashSet<TokenId> = [self.eos_token, self.eot_token, self.eom_token]
            .into_iter()
            .flatten()
            .collect();

        for (index, text) in self.tokens.iter().enumerate() {
            let id = TokenId::from(index);
            let control = self.token_type(id) == Some(TokenType::Control);
            if control && EOG_MARKERS.contains(&text.as_str()) {
                eog.insert(id);
            }
        }
        eog
    }

    /// Control and user-defined tokens recognizable in raw text, longest first.
    pub fn special_literals(&self) -> Vec<(String, TokenId)> {
        let mut literals: Vec<(String, TokenId)> = self
            .tokens
            .iter()
            .enumerate()
            .map(|(index, text)| (text, TokenId::from(index)))
            .filter(|(text, id)| {
                !text.is_empty()
                    && matches!(
                        self.token_type(*id),
                        Some(TokenType::Control | TokenType::UserDefined)
                    )
            })
            .map(|(text, id)| (text.clone(), id))
            .collect();
        literals.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        literals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl TokenType {
    /// Decodes `tokenizer.ggml.token_type` values.
    pub fn from_gguf(value: i64) -> Self {
        match value {
            2 => Self::Unknown,
            3 => Self::Control,
            4 => Self::UserDefined,
            5 => Self::Unused,
            6 => Self::Byte,
            _ => Self::Normal,
        }
    }
}

/// Special-token bookkeeping shared by the subword models.
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    eog: HashSet<TokenId>,
    literals: Vec<(String, TokenId)>,
}

impl SpecialTokens {
    pub fn from_vocabulary(vocab: &Vocabulary) -> Self {
        Self {
            eog: vocab.eog_tokens(),
            literals: vocab.special_literals(),
        }
    }

    pub fn is_eog(&self, token: TokenId) -> bool {
        self.eog.contains(&token)
    }

    pub fn literals(&self) -> &[(String, TokenId)] {
        &self.literals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment<'a> {
    Text(&'a str),
    Special(TokenId),
}

/// Splits `text` around literal occurrences of special tokens.
pub fn split_special<'a>(text: &'a str, literals: &[(String, TokenId)]) -> Vec<Fragment<'a>> {
    let mut fragments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];
        match literals.iter().find(|(lit, _)| rest.starts_with(lit.as_str())) {
            Some((lit, id)) => {
                if start < i {
                    fragments.push(Fragment::Text(&text[start..i]));
                }
                fragments.push(Fragment::Special(*id));
                i += lit.len();
                start = i;
            }
            None => i += rest.chars().next().map_or(1, char::len_utf8),
        }
    }

    if start < text.len() {
        fragments.push(Fragment::Text(&text[start..]));
    }
    fragments
}

/// Per-algorithm half of a GGUF vocabulary; the shared half (special tokens,
/// BOS/EOS placement, piece rendering) comes with the blanket [`Vocab`] impl.
pub trait SubwordModel: Send + Sync {
    fn vocabulary(&self) -> &Vocabulary;
    fn specials(&self) -> &SpecialTokens;

    /// Encodes plain text. `leading` is true for the first fragment of the
    /// input.
    fn encode_text(&self, text: &str, leading: bool, out: &mut Vec<TokenId>) -> Result<()>;

    /// Bytes printed for a normal token.
    fn normal_piece(&self, text: &str) -> Vec<u8>;
}

fn encode_with<T: SubwordModel + ?Sized>(
    model: &T,
    text: &str,
    options: &TokenizeOptions,
) -> Result<Vec<TokenId>> {
    let vocab = model.vocabulary();
    let mut tokens = Vec::new();

    if options.add_special && vocab.add_bos {
        tokens.extend(vocab.bos_token);
    }

    let fragments = if options.parse_special {
        split_special(text, model.specials().literals())
    } else {
        vec![Fragment::Text(text)]
    };

    for (i, fragment) in fragments.into_iter().enumerate() {
        match fragment {
            Fragment::Special(id) => tokens.push(id),
            Fragment::Text(text) => model.encode_text(text, i == 0, &mut tokens)?,
        }
    }

    if options.add_special && vocab.add_eos {
        tokens.extend(vocab.eos_token);
    }

    Ok(tokens)
}

/// Value of a `<0xAB>` byte token.
pub(crate) fn parse_byte_token(text: &str) -> Option<u8> {
    let hex = text.strip_prefix("<0x")?.strip_suffix('>')?;
    u8::from_str_radix(hex, 16).ok()
}

impl<T: SubwordModel> Vocab for T {
    fn n_tokens(&self) -> usize {
        self.vocabulary().size()
    }

    fn tokenize_into(
        &self,
        text: &str,
        options: &TokenizeOptions,
        out: &mut [TokenId],
    ) -> Result<TokenCount> {
        let tokens = encode_with(self, text, options)?;
        if out.len() < tokens.len() {
            return Ok(TokenCount::Required(tokens.len()));
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(TokenCount::Written(tokens.len()))
    }

    fn token_to_piece(&self, token: TokenId, special: bool) -> Result<Vec<u8>> {
        let vocab = self.vocabulary();
        let text = vocab.token(token).ok_or_else(|| {
            InferenceError::Tokenization(format!(
                "token {} is outside the vocabulary of {}",
                token.0,
                vocab.size()
            ))
        })?;

        let piece = match vocab.token_type(token).unwrap_or(TokenType::Normal) {
            TokenType::Control if special => text.as_bytes().to_vec(),
            TokenType::Control | TokenType::Unused => Vec::new(),
            TokenType::UserDefined | TokenType::Unknown => text.as_bytes().to_vec(),
            TokenType::Byte => match parse_byte_token(text) {
                Some(byte) => vec![byte],
                None => self.normal_piece(text),
            },
            TokenType::Normal => self.normal_piece(text),
        };
        Ok(piece)
    }

    fn token_type(&self, token: TokenId) -> Option<TokenType> {
        self.vocabulary().token_type(token)
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.specials().is_eog(token)
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.vocabulary().bos_token
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.vocabulary().eos_token
    }
}

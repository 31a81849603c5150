use super::merge::{char_units, merge_pairs};
use super::{SpecialTokens, SubwordModel, TokenType, Vocabulary};
use crate::core::{InferenceError, Result, TokenId};
use std::cmp::Reverse;
use std::collections::HashMap;

const PRE_TOKENIZER: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Byte-level BPE vocabulary (`tokenizer.ggml.model = gpt2`).
pub struct BpeTokenizer {
    vocab: Vocabulary,
    specials: SpecialTokens,
    encoder: HashMap<String, TokenId>,
    bpe_ranks: HashMap<(String, String), usize>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    pattern: fancy_regex::Regex,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocabulary) -> Result<Self> {
        let byte_encoder = Self::build_byte_encoder();
        let byte_decoder: HashMap<char, u8> = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        let mut encoder = HashMap::new();
        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId::from(i);
            if !matches!(
                vocab.token_type(id),
                Some(TokenType::Control | TokenType::Unused)
            ) {
                encoder.entry(token.clone()).or_insert(id);
            }
        }

        let mut bpe_ranks = HashMap::new();
        for (i, merge) in vocab.merges.iter().enumerate() {
            if let Some((left, right)) = merge.split_once(' ') {
                bpe_ranks.insert((left.to_string(), right.to_string()), i);
            }
        }

        let pattern = fancy_regex::Regex::new(PRE_TOKENIZER)
            .map_err(|e| InferenceError::Tokenization(e.to_string()))?;

        Ok(Self {
            specials: SpecialTokens::from_vocabulary(&vocab),
            vocab,
            encoder,
            bpe_ranks,
            byte_encoder,
            byte_decoder,
            pattern,
        })
    }

    /// GPT-2 byte alphabet: printable bytes keep their code point, the rest
    /// are shifted past U+00FF.
    fn build_byte_encoder() -> [char; 256] {
        let mut table = ['\0'; 256];
        let mut next = 256u32;

        for b in 0..=255u8 {
            let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
            let code = if printable {
                b as u32
            } else {
                next += 1;
                next - 1
            };
            table[b as usize] = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
        }
        table
    }

    fn byte_encode(&self, text: &str) -> String {
        text.bytes().map(|b| self.byte_encoder[b as usize]).collect()
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let symbols = merge_pairs(token, char_units(token), |pair, split| {
            let key = (pair[..split].to_string(), pair[split..].to_string());
            self.bpe_ranks.get(&key).map(|&rank| Reverse(rank))
        });
        symbols.into_iter().map(|range| token[range].to_string()).collect()
    }

    fn push_piece(&self, piece: &str, out: &mut Vec<TokenId>) -> Result<()> {
        if let Some(&id) = self.encoder.get(piece) {
            out.push(id);
            return Ok(());
        }

        for c in piece.chars() {
            match self.encoder.get(c.encode_utf8(&mut [0; 4]) as &str) {
                Some(&id) => out.push(id),
                None => match self.vocab.unk_token {
                    Some(unk) => out.push(unk),
                    None => {
                        return Err(InferenceError::Tokenization(format!(
                            "no token covers `{piece}`"
                        )))
                    }
                },
            }
        }
        Ok(())
    }
}

impl SubwordModel for BpeTokenizer {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn specials(&self) -> &SpecialTokens {
        &self.specials
    }

    fn encode_text(&self, text: &str, _leading: bool, out: &mut Vec<TokenId>) -> Result<()> {
        for found in self.pattern.find_iter(text) {
            let found = found.map_err(|e| InferenceError::Tokenization(e.to_string()))?;
            let encoded = self.byte_encode(found.as_str());

            for piece in self.bpe(&encoded) {
                self.push_piece(&piece, out)?;
            }
        }
        Ok(())
    }

    fn normal_piece(&self, text: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(text.len());
        for c in text.chars() {
            match self.byte_decoder.get(&c) {
                Some(&b) => bytes.push(b),
                None => bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
            }
        }
        bytes
    }
}

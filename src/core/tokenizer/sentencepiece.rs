use super::merge::{char_units, merge_pairs};
use super::{parse_byte_token, SpecialTokens, SubwordModel, TokenType, Vocabulary};
use crate::core::{InferenceError, Result, TokenId};
use std::cmp::Ordering;
use std::collections::HashMap;

const WHITESPACE: char = '\u{2581}';

/// Merge priority: higher scores merge first.
struct Score(f32);

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

/// SentencePiece vocabulary as stored in GGUF (`tokenizer.ggml.model = llama`):
/// score-ranked pair merges over characters, `▁` for spaces, `<0xXX>` byte
/// fallback.
pub struct SentencePieceTokenizer {
    vocab: Vocabulary,
    specials: SpecialTokens,
    encoder: HashMap<String, TokenId>,
    byte_tokens: [Option<TokenId>; 256],
}

impl SentencePieceTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::new();
        let mut byte_tokens = [None; 256];

        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId::from(i);
            match vocab.token_type(id).unwrap_or(TokenType::Normal) {
                TokenType::Byte => {
                    if let Some(byte) = parse_byte_token(token) {
                        byte_tokens[byte as usize] = Some(id);
                    }
                }
                TokenType::Control | TokenType::Unused => {}
                _ => {
                    encoder.entry(token.clone()).or_insert(id);
                }
            }
        }

        Self {
            specials: SpecialTokens::from_vocabulary(&vocab),
            vocab,
            encoder,
            byte_tokens,
        }
    }

    fn push_symbol(&self, symbol: &str, out: &mut Vec<TokenId>) -> Result<()> {
        if let Some(&id) = self.encoder.get(symbol) {
            out.push(id);
            return Ok(());
        }

        let bytes: Option<Vec<TokenId>> = symbol
            .bytes()
            .map(|b| self.byte_tokens[b as usize])
            .collect();
        match (bytes, self.vocab.unk_token) {
            (Some(ids), _) => out.extend(ids),
            (None, Some(unk)) => out.push(unk),
            (None, None) => {
                return Err(InferenceError::Tokenization(format!(
                    "no token covers `{symbol}` and the vocabulary has no unknown token"
                )))
            }
        }
        Ok(())
    }
}

impl SubwordModel for SentencePieceTokenizer {
    fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    fn specials(&self) -> &SpecialTokens {
        &self.specials
    }

    fn encode_text(&self, text: &str, leading: bool, out: &mut Vec<TokenId>) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }

        let mut normalized = String::with_capacity(text.len() + 3);
        if leading && self.vocab.add_space_prefix {
            normalized.push(WHITESPACE);
        }
        normalized.extend(text.chars().map(|c| if c == ' ' { WHITESPACE } else { c }));

        let symbols = merge_pairs(&normalized, char_units(&normalized), |pair, _| {
            self.encoder.get(pair).map(|&id| Score(self.vocab.score(id)))
        });
        for range in symbols {
            self.push_symbol(&normalized[range], out)?;
        }
        Ok(())
    }

    fn normal_piece(&self, text: &str) -> Vec<u8> {
        text.replace(WHITESPACE, " ").into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::{TokenCount, TokenizeOptions, Vocab};

    fn vocabulary() -> Vocabulary {
        let pieces = [
            "<unk>", "<s>", "</s>", "<0x0A>", "<0xC3>", "<0xA9>", "▁", "H", "e", "l", "o", "He",
            "Hel", "lo", "▁Hel", "▁w", "r", "d", "▁wor", "or", "▁wo", "ld", "<start_of_turn>",
        ];
        let mut vocab = Vocabulary::new(pieces.iter().map(|s| s.to_string()).collect());
        vocab.bos_token = Some(TokenId(1));
        vocab.eos_token = Some(TokenId(2));
        vocab.unk_token = Some(TokenId(0));
        vocab.add_bos = true;
        vocab.set_type(TokenId(0), TokenType::Unknown);
        vocab.set_type(TokenId(1), TokenType::Control);
        vocab.set_type(TokenId(2), TokenType::Control);
        vocab.set_type(TokenId(22), TokenType::Control);
        for id in 3..=5 {
            vocab.set_type(TokenId(id), TokenType::Byte);
        }
        for (i, piece) in pieces.iter().enumerate() {
            vocab.scores[i] = piece.chars().count() as f32;
        }
        vocab
    }

    fn encode(
        tokenizer: &SentencePieceTokenizer,
        text: &str,
        options: TokenizeOptions,
    ) -> Vec<i32> {
        let mut out = vec![TokenId(-1); 64];
        match tokenizer.tokenize_into(text, &options, &mut out).unwrap() {
            TokenCount::Written(n) => out[..n].iter().map(|t| t.0).collect(),
            TokenCount::Required(n) => panic!("buffer too small, need {n}"),
        }
    }

    #[test]
    fn test_merges_by_score() {
        let tokenizer = SentencePieceTokenizer::new(vocabulary());
        let ids = encode(&tokenizer, "Hello", TokenizeOptions::default());

        // <s> ▁Hel lo
        assert_eq!(ids, vec![1, 14, 13]);
    }

    #[test]
    fn test_without_space_prefix() {
        let mut vocab = vocabulary();
        vocab.add_space_prefix = false;
        let tokenizer = SentencePieceTokenizer::new(vocab);

        let ids = encode(&tokenizer, "Hello", TokenizeOptions::plain());
        assert_eq!(ids, vec![12, 13]);
    }

    #[test]
    fn test_byte_fallback_and_unknown() {
        let tokenizer = SentencePieceTokenizer::new(vocabulary());

        let ids = encode(&tokenizer, "\n", TokenizeOptions::plain());
        assert_eq!(ids, vec![6, 3]);

        let ids = encode(&tokenizer, "é", TokenizeOptions::plain());
        assert_eq!(ids, vec![6, 4, 5]);

        let ids = encode(&tokenizer, "z", TokenizeOptions::plain());
        assert_eq!(ids, vec![6, 0]);
    }

    #[test]
    fn test_parse_special() {
        let tokenizer = SentencePieceTokenizer::new(vocabulary());

        let ids = encode(&tokenizer, "<start_of_turn>Hello", TokenizeOptions::default());
        assert_eq!(ids, vec![1, 22, 12, 13]);
    }

    #[test]
    fn test_required_length_reported() {
        let tokenizer = SentencePieceTokenizer::new(vocabulary());
        let count = tokenizer
            .tokenize_into("Hello", &TokenizeOptions::default(), &mut [])
            .unwrap();
        assert_eq!(count, TokenCount::Required(3));
    }

    #[test]
    fn test_pieces() {
        let tokenizer = SentencePieceTokenizer::new(vocabulary());

        assert_eq!(tokenizer.token_to_piece(TokenId(14), false).unwrap(), b" Hel");
        assert_eq!(tokenizer.token_to_piece(TokenId(3), false).unwrap(), b"\n");
        assert_eq!(tokenizer.token_to_piece(TokenId(2), false).unwrap(), b"");
        assert_eq!(tokenizer.token_to_piece(TokenId(2), true).unwrap(), b"</s>");
        assert!(tokenizer.token_to_piece(TokenId(99), true).is_err());
        assert!(tokenizer.is_eog(TokenId(2)));
        assert!(!tokenizer.is_eog(TokenId(1)));
    }

    #[test]
    fn test_missing_coverage_is_an_error() {
        let mut vocab = vocabulary();
        vocab.unk_token = None;
        let tokenizer = SentencePieceTokenizer::new(vocab);

        let result = tokenizer.tokenize_into("z", &TokenizeOptions::plain(), &mut []);
        assert!(matches!(result, Err(InferenceError::Tokenization(_))));
    }

    #[test]
    fn test_long_run_encodes_pairwise() {
        let mut vocab = Vocabulary::new(vec!["a".to_string(), "aa".to_string()]);
        vocab.add_space_prefix = false;
        vocab.scores = vec![0.0, 1.0];
        let tokenizer = SentencePieceTokenizer::new(vocab);

        let ids = encode_long(&tokenizer, &"a".repeat(16_000));
        assert_eq!(ids.len(), 8_000);
        assert!(ids.iter().all(|&id| id == 1));
    }

    fn encode_long(tokenizer: &SentencePieceTokenizer, text: &str) -> Vec<i32> {
        let mut out = vec![TokenId(-1); text.len()];
        match tokenizer.tokenize_into(text, &TokenizeOptions::plain(), &mut out).unwrap() {
            TokenCount::Written(n) => out[..n].iter().map(|t| t.0).collect(),
            TokenCount::Required(n) => panic!("buffer too small, need {n}"),
        }
    }
}

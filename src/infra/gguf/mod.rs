pub mod model;

pub use model::{GgufContext, GgufLoader, GgufModel};

use crate::core::tokenizer::{TokenType, TokenizerKind};
use crate::core::{InferenceError, ModelMeta, Result, TokenId, Vocabulary};
use candle_core::quantized::gguf_file::{Content, Value};
use std::collections::HashMap;
use std::path::Path;

/// Typed view over the key/value section of a GGUF file.
pub struct GgufMetadata<'a> {
    kv: &'a HashMap<String, Value>,
}

impl<'a> GgufMetadata<'a> {
    pub fn new(kv: &'a HashMap<String, Value>) -> Self {
        Self { kv }
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.kv.get(key)
    }

    pub fn string(&self, key: &str) -> Option<&'a str> {
        match self.kv.get(key)? {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn uint(&self, key: &str) -> Option<u64> {
        self.kv.get(key).and_then(as_u64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.kv.get(key)? {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn array(&self, key: &str) -> Option<&'a [Value]> {
        match self.kv.get(key)? {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    fn token_id(&self, key: &str) -> Option<TokenId> {
        self.uint(key)
            .and_then(|id| i32::try_from(id).ok())
            .map(TokenId)
    }

    pub fn architecture(&self) -> &'a str {
        self.string("general.architecture").unwrap_or("llama")
    }

    pub fn tokenizer_kind(&self) -> Result<TokenizerKind> {
        let model = self.string("tokenizer.ggml.model").unwrap_or("llama");
        TokenizerKind::from_gguf(model).ok_or_else(|| {
            InferenceError::Tokenization(format!("unsupported tokenizer model `{model}`"))
        })
    }

    pub fn to_vocabulary(&self) -> Result<Vocabulary> {
        let tokens: Vec<String> = self
            .array("tokenizer.ggml.tokens")
            .ok_or_else(|| {
                InferenceError::Tokenization("metadata has no tokenizer.ggml.tokens".to_string())
            })?
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(InferenceError::Tokenization(format!(
                    "token entry is not a string: {other:?}"
                ))),
            })
            .collect::<Result<_>>()?;

        let mut vocab = Vocabulary::new(tokens);

        if let Some(scores) = self.array("tokenizer.ggml.scores") {
            for (slot, value) in vocab.scores.iter_mut().zip(scores) {
                *slot = as_f64(value).unwrap_or(0.0) as f32;
            }
        }
        if let Some(types) = self.array("tokenizer.ggml.token_type") {
            for (slot, value) in vocab.types.iter_mut().zip(types) {
                *slot = TokenType::from_gguf(as_i64(value).unwrap_or(1));
            }
        }
        if let Some(merges) = self.array("tokenizer.ggml.merges") {
            vocab.merges = merges
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
        }

        vocab.bos_token = self.token_id("tokenizer.ggml.bos_token_id");
        vocab.eos_token = self.token_id("tokenizer.ggml.eos_token_id");
        vocab.eot_token = self.token_id("tokenizer.ggml.eot_token_id");
        vocab.eom_token = self.token_id("tokenizer.ggml.eom_token_id");
        vocab.pad_token = self.token_id("tokenizer.ggml.padding_token_id");
        vocab.unk_token = self.token_id("tokenizer.ggml.unknown_token_id");

        let kind = self.tokenizer_kind()?;
        vocab.add_bos = self
            .bool("tokenizer.ggml.add_bos_token")
            .unwrap_or(kind == TokenizerKind::SentencePiece);
        vocab.add_eos = self.bool("tokenizer.ggml.add_eos_token").unwrap_or(false);
        vocab.add_space_prefix = self
            .bool("tokenizer.ggml.add_space_prefix")
            .unwrap_or(kind == TokenizerKind::SentencePiece);

        Ok(vocab)
    }

    pub fn to_model_meta(&self) -> ModelMeta {
        let arch = self.architecture();
        let defaults = ModelMeta::default();

        ModelMeta {
            name: self.string("general.name").unwrap_or_default().to_string(),
            architecture: arch.to_string(),
            context_length: self
                .uint(&format!("{arch}.context_length"))
                .map(|n| n as usize)
                .unwrap_or(defaults.context_length),
            vocab_size: self
                .array("tokenizer.ggml.tokens")
                .map_or(0, |tokens| tokens.len()),
            quantization: self.uint("general.file_type").map(file_type_name),
        }
    }
}

/// Reads only the header and metadata of a GGUF file.
pub fn read_meta(path: &Path) -> Result<ModelMeta> {
    let shown = path.display().to_string();
    let mut file =
        std::fs::File::open(path).map_err(|e| InferenceError::model_load(&shown, e))?;
    let content = Content::read(&mut file).map_err(|e| InferenceError::model_load(&shown, e))?;
    Ok(GgufMetadata::new(&content.metadata).to_model_meta())
}

fn as_u64(value: &Value) -> Option<u64> {
    match *value {
        Value::U8(n) => Some(n as u64),
        Value::U16(n) => Some(n as u64),
        Value::U32(n) => Some(n as u64),
        Value::U64(n) => Some(n),
        Value::I8(n) => u64::try_from(n).ok(),
        Value::I16(n) => u64::try_from(n).ok(),
        Value::I32(n) => u64::try_from(n).ok(),
        Value::I64(n) => u64::try_from(n).ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match *value {
        Value::I8(n) => Some(n as i64),
        Value::I16(n) => Some(n as i64),
        Value::I32(n) => Some(n as i64),
        Value::I64(n) => Some(n),
        _ => as_u64(value).and_then(|n| i64::try_from(n).ok()),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match *value {
        Value::F32(n) => Some(n as f64),
        Value::F64(n) => Some(n),
        _ => as_i64(value).map(|n| n as f64),
    }
}

fn file_type_name(file_type: u64) -> String {
    match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        other => return format!("type {other}"),
    }
    .to_string()
}

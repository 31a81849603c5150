#![allow(dead_code)]

use llama_inference::core::tokenizer::{SentencePieceTokenizer, TokenType};
use llama_inference::{
    Batch, CancelToken, ContextParams, InferenceContext, InferenceError, Model, ModelLoader,
    ModelMeta, Result, TokenId, Vocab, Vocabulary,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const UNK: i32 = 0;
pub const BOS: i32 = 1;
pub const EOS: i32 = 2;

const ALPHABET: &str = " abcdefghijklmnopqrstuvwxyzHW,!.";

/// Token id of `c` in the fixture vocabulary.
pub fn token(c: char) -> i32 {
    let index = ALPHABET
        .chars()
        .position(|a| a == c)
        .unwrap_or_else(|| panic!("`{c}` is not in the fixture alphabet"));
    3 + index as i32
}

/// Script that makes the model print `text`, then end generation.
pub fn script_for(text: &str) -> Vec<i32> {
    let mut script: Vec<i32> = text.chars().map(token).collect();
    script.push(EOS);
    script
}

/// One token per character, SentencePiece style (`▁` for spaces).
pub fn vocabulary() -> Vocabulary {
    let mut tokens: Vec<String> = ["<unk>", "<s>", "</s>"].iter().map(|s| s.to_string()).collect();
    tokens.extend(
        ALPHABET
            .chars()
            .map(|c| if c == ' ' { "\u{2581}".to_string() } else { c.to_string() }),
    );

    let mut vocab = Vocabulary::new(tokens);
    vocab.unk_token = Some(TokenId(UNK));
    vocab.bos_token = Some(TokenId(BOS));
    vocab.eos_token = Some(TokenId(EOS));
    vocab.add_bos = true;
    vocab.add_space_prefix = false;
    vocab.set_type(TokenId(UNK), TokenType::Unknown);
    vocab.set_type(TokenId(BOS), TokenType::Control);
    vocab.set_type(TokenId(EOS), TokenType::Control);
    vocab
}

/// Shared counters a test can inspect while contexts run on worker threads.
#[derive(Default)]
pub struct Tally {
    pub contexts_created: AtomicUsize,
    pub decodes: AtomicUsize,
    pub decodes_after_cancel: AtomicUsize,
    /// `(first position, batch length)` of every decode call.
    pub log: Mutex<Vec<(usize, usize)>>,
    watch: Mutex<Option<CancelToken>>,
}

impl Tally {
    /// Counts decodes that start after `token` was cancelled.
    pub fn watch(&self, token: CancelToken) {
        *self.watch.lock() = Some(token);
    }

    pub fn decode_log(&self) -> Vec<(usize, usize)> {
        self.log.lock().clone()
    }
}

/// Model whose every decode yields a one-hot distribution on the next token
/// of its script.
pub struct ScriptedModel {
    meta: ModelMeta,
    vocab: SentencePieceTokenizer,
    script: Vec<i32>,
    pub fail_at: Option<usize>,
    pub panic_at: Option<usize>,
    pub step_delay: Duration,
    pub tally: Arc<Tally>,
}

impl ScriptedModel {
    pub fn new(script: Vec<i32>) -> Self {
        Self {
            meta: ModelMeta {
                name: "scripted".to_string(),
                vocab_size: 3 + ALPHABET.chars().count(),
                ..ModelMeta::default()
            },
            vocab: SentencePieceTokenizer::new(vocabulary()),
            script,
            fail_at: None,
            panic_at: None,
            step_delay: Duration::ZERO,
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn printing(text: &str) -> Self {
        Self::new(script_for(text))
    }

    pub fn fail_at(mut self, decode: usize) -> Self {
        self.fail_at = Some(decode);
        self
    }

    pub fn panic_at(mut self, decode: usize) -> Self {
        self.panic_at = Some(decode);
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Model for ScriptedModel {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn vocab(&self) -> &dyn Vocab {
        &self.vocab
    }

    fn new_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if params.n_ctx == 0 {
            return Err(InferenceError::ContextCreation("zero context".to_string()));
        }
        self.tally.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            script: self.script.clone(),
            n_vocab: self.vocab.n_tokens(),
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
            n_past: 0,
            decodes: 0,
            fail_at: self.fail_at,
            panic_at: self.panic_at,
            step_delay: self.step_delay,
            logits: Vec::new(),
            tally: self.tally.clone(),
        }))
    }
}

pub struct ScriptedContext {
    script: Vec<i32>,
    n_vocab: usize,
    n_ctx: usize,
    n_threads: usize,
    n_past: usize,
    /// Decodes since the last clear; indexes the script.
    decodes: usize,
    fail_at: Option<usize>,
    panic_at: Option<usize>,
    step_delay: Duration,
    logits: Vec<f32>,
    tally: Arc<Tally>,
}

impl InferenceContext for ScriptedContext {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_threads(&self) -> usize {
        self.n_threads
    }

    fn n_past(&self) -> usize {
        self.n_past
    }

    fn decode(&mut self, batch: &Batch) -> Result<()> {
        let first = batch
            .first_pos()
            .ok_or_else(|| InferenceError::Decode("empty batch".to_string()))?;
        if first != self.n_past {
            return Err(InferenceError::Decode(format!(
                "batch at {first}, cache at {}",
                self.n_past
            )));
        }

        if let Some(token) = self.tally.watch.lock().as_ref() {
            if token.is_cancelled() {
                self.tally.decodes_after_cancel.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.tally.decodes.fetch_add(1, Ordering::SeqCst);
        self.tally.log.lock().push((first, batch.len()));

        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        if self.panic_at == Some(self.decodes) {
            panic!("scripted panic at decode {}", self.decodes);
        }
        if self.fail_at == Some(self.decodes) {
            return Err(InferenceError::Decode("scripted failure".to_string()));
        }

        let next = self.script.get(self.decodes).copied().unwrap_or(EOS);
        self.logits = vec![0.0; self.n_vocab];
        self.logits[next as usize] = 1.0;
        self.decodes += 1;
        self.n_past += batch.len();
        Ok(())
    }

    fn logits(&self, _slot: usize) -> Result<&[f32]> {
        if self.logits.is_empty() {
            return Err(InferenceError::Sampling("nothing decoded yet".to_string()));
        }
        Ok(&self.logits)
    }

    fn clear(&mut self) {
        self.n_past = 0;
        self.decodes = 0;
        self.logits.clear();
    }
}

/// Hands out one shared model for any path that exists on disk.
pub struct ScriptedLoader {
    model: Arc<ScriptedModel>,
    pub loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(model: ScriptedModel) -> Self {
        Self {
            model: Arc::new(model),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn tally(&self) -> Arc<Tally> {
        self.model.tally.clone()
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Model>> {
        if !path.exists() {
            return Err(InferenceError::model_load(
                path.display().to_string(),
                "no such file",
            ));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let model: Arc<dyn Model> = self.model.clone();
        Ok(model)
    }
}

/// Empty file standing in for a model on disk; removed on drop.
pub struct FixtureFile(PathBuf);

impl FixtureFile {
    pub fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "llama-inference-{}-{}-{name}.gguf",
            std::process::id(),
            thread_id()
        ));
        std::fs::write(&path, b"").unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for FixtureFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn thread_id() -> String {
    format!("{:?}", thread::current().id())
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

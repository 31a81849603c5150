use crate::core::tokenizer::Utf8Stream;
use crate::core::{
    Batch, InferenceContext, InferenceError, Model, TokenizeOptions, TokenizerAdapter,
    DEFAULT_BATCH_CAPACITY,
};
use crate::sample::greedy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    /// Largest prompt accepted in one prefill batch.
    pub batch_capacity: usize,
    /// Print control tokens as their literal text.
    pub render_special_tokens: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            render_special_tokens: true,
        }
    }
}

impl GenerationParams {
    pub fn max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }
}

/// Cooperative stop flag, checked once per generated token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    MaxTokens,
    ContextFull,
    Cancelled,
    /// Generation broke off after output had started; the text is partial.
    DecodeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub text: String,
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prompt_eval_duration: Duration,
    pub eval_duration: Duration,
}

impl Response {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.eval_duration.as_secs_f64();
        if secs > 0.0 {
            self.generated_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TokenProduced(String),
    Completed(Response),
    Failed(InferenceError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TokenProduced(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prefilling,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One prompt-to-response run against a borrowed context.
pub struct Session<'a> {
    model: &'a dyn Model,
    context: &'a mut dyn InferenceContext,
    params: GenerationParams,
    cancel: CancelToken,
    state: SessionState,
}

impl<'a> Session<'a> {
    pub fn new(
        model: &'a dyn Model,
        context: &'a mut dyn InferenceContext,
        params: GenerationParams,
        cancel: CancelToken,
    ) -> Self {
        Self {
            model,
            context,
            params,
            cancel,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to a terminal state. `emit` sees every fragment in
    /// order, then exactly one terminal event.
    pub fn run<F>(mut self, prompt: &str, mut emit: F) -> SessionState
    where
        F: FnMut(StreamEvent),
    {
        let started = Instant::now();

        if self.context.is_dirty() {
            tracing::debug!(n_past = self.context.n_past(), "clearing reused context");
            self.context.clear();
        }

        if self.cancel.is_cancelled() {
            tracing::debug!("cancelled before prefill");
            emit(StreamEvent::Completed(Response {
                text: String::new(),
                stop_reason: StopReason::Cancelled,
                prompt_tokens: 0,
                generated_tokens: 0,
                prompt_eval_duration: Duration::ZERO,
                eval_duration: Duration::ZERO,
            }));
            return self.finish(SessionState::Cancelled);
        }

        self.state = SessionState::Prefilling;
        let model = self.model;
        let adapter = TokenizerAdapter::new(model.vocab());

        let options = TokenizeOptions::default();
        let capacity = self.params.batch_capacity;
        let prompt_tokens = match adapter.encode_prompt(prompt, &options, capacity) {
            Ok(tokens) => tokens,
            Err(e) => return self.fail(e, &mut emit),
        };
        let batch = match Batch::prefill(&prompt_tokens, self.params.batch_capacity) {
            Ok(batch) => batch,
            Err(e) => return self.fail(e, &mut emit),
        };
        if let Err(e) = self.context.decode(&batch) {
            return self.fail(e, &mut emit);
        }
        let prompt_eval_duration = started.elapsed();
        tracing::debug!(
            prompt_tokens = prompt_tokens.len(),
            elapsed = ?prompt_eval_duration,
            "prefill complete"
        );

        self.state = SessionState::Generating;
        let eval_start = Instant::now();
        let mut slot = batch.len() - 1;
        let mut pos = prompt_tokens.len();
        let mut generated = 0usize;
        let mut text = String::new();
        let mut utf8 = Utf8Stream::new();
        // decoded text held back while a character is still incomplete
        let mut held = String::new();

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if generated >= self.params.max_tokens {
                break StopReason::MaxTokens;
            }

            let token = match self.context.logits(slot).and_then(greedy) {
                Ok(token) => token,
                Err(e) => break StopReason::DecodeFailed(e.to_string()),
            };
            if adapter.is_end_of_generation(token) {
                break StopReason::EndOfGeneration;
            }

            let piece = match adapter.decode(token, self.params.render_special_tokens) {
                Ok(piece) => piece,
                Err(e) => break StopReason::DecodeFailed(e.to_string()),
            };
            generated += 1;

            held.push_str(&utf8.push(&piece.bytes));
            if !held.is_empty() && !utf8.has_pending() {
                let fragment = std::mem::take(&mut held);
                text.push_str(&fragment);
                emit(StreamEvent::TokenProduced(fragment));
            }
            tracing::trace!(token = token.0, pos, special = piece.special, "sampled");

            if generated >= self.params.max_tokens {
                break StopReason::MaxTokens;
            }
            if pos >= self.context.n_ctx() {
                break StopReason::ContextFull;
            }
            if let Err(e) = self.context.decode(&Batch::step(token, pos)) {
                break StopReason::DecodeFailed(e.to_string());
            }
            pos += 1;
            slot = 0;
        };

        // the last token did not emit, so its event carries the flushed tail
        held.push_str(&utf8.finish());
        if !held.is_empty() {
            text.push_str(&held);
            emit(StreamEvent::TokenProduced(held));
        }

        let response = Response {
            text,
            stop_reason,
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated,
            prompt_eval_duration,
            eval_duration: eval_start.elapsed(),
        };

        match &response.stop_reason {
            StopReason::DecodeFailed(reason) => tracing::warn!(
                generated = response.generated_tokens,
                %reason,
                "generation broke off, keeping partial output"
            ),
            reason => tracing::info!(
                prompt_tokens = response.prompt_tokens,
                generated = response.generated_tokens,
                ?reason,
                tokens_per_second = response.tokens_per_second(),
                "generation finished"
            ),
        }

        let state = if response.stop_reason == StopReason::Cancelled {
            SessionState::Cancelled
        } else {
            SessionState::Completed
        };
        emit(StreamEvent::Completed(response));
        self.finish(state)
    }

    fn fail<F>(self, error: InferenceError, emit: &mut F) -> SessionState
    where
        F: FnMut(StreamEvent),
    {
        tracing::warn!(state = ?self.state, %error, "generation failed");
        emit(StreamEvent::Failed(error));
        self.finish(SessionState::Failed)
    }

    fn finish(mut self, state: SessionState) -> SessionState {
        self.state = state;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tokenizer::{BpeTokenizer, SentencePieceTokenizer, TokenType};
    use crate::core::{ContextParams, ModelMeta, Result, TokenId, Vocab, Vocabulary};

    const EOS: i32 = 2;

    /// Char-level vocabulary: `<unk>`, `<s>`, `</s>`, then one token per
    /// character of `chars`.
    fn vocabulary(chars: &str) -> Vocabulary {
        let mut tokens: Vec<String> = ["<unk>", "<s>", "</s>"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        tokens.extend(chars.chars().map(String::from));
        let mut vocab = Vocabulary::new(tokens);
        vocab.unk_token = Some(TokenId(0));
        vocab.bos_token = Some(TokenId(1));
        vocab.eos_token = Some(TokenId(EOS));
        vocab.add_bos = true;
        vocab.add_space_prefix = false;
        vocab.set_type(TokenId(0), TokenType::Unknown);
        vocab.set_type(TokenId(1), TokenType::Control);
        vocab.set_type(TokenId(2), TokenType::Control);
        vocab
    }

    struct FakeModel {
        meta: ModelMeta,
        vocab: Box<dyn Vocab>,
    }

    impl Model for FakeModel {
        fn meta(&self) -> &ModelMeta {
            &self.meta
        }

        fn vocab(&self) -> &dyn Vocab {
            self.vocab.as_ref()
        }

        fn new_context(
            &self,
            _params: &ContextParams,
        ) -> Result<Box<dyn crate::core::InferenceContext>> {
            unreachable!("tests build contexts directly")
        }
    }

    /// Emits the next scripted token after every decode.
    struct FakeContext {
        script: Vec<i32>,
        n_vocab: usize,
        n_ctx: usize,
        n_past: usize,
        decodes: usize,
        fail_at: Option<usize>,
        logits: Vec<f32>,
        cleared: usize,
    }

    impl FakeContext {
        fn new(script: &[i32], n_vocab: usize) -> Self {
            Self {
                script: script.to_vec(),
                n_vocab,
                n_ctx: 64,
                n_past: 0,
                decodes: 0,
                fail_at: None,
                logits: Vec::new(),
                cleared: 0,
            }
        }
    }

    impl InferenceContext for FakeContext {
        fn n_ctx(&self) -> usize {
            self.n_ctx
        }

        fn n_threads(&self) -> usize {
            1
        }

        fn n_past(&self) -> usize {
            self.n_past
        }

        fn decode(&mut self, batch: &Batch) -> Result<()> {
            assert_eq!(batch.first_pos(), Some(self.n_past));
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
            Ok(&self.logits)
        }

        fn clear(&mut self) {
            self.n_past = 0;
            self.cleared += 1;
        }
    }

    fn model(chars: &str) -> FakeModel {
        FakeModel {
            meta: ModelMeta::default(),
            vocab: Box::new(SentencePieceTokenizer::new(vocabulary(chars))),
        }
    }

    fn run(
        model: &FakeModel,
        context: &mut FakeContext,
        params: GenerationParams,
        cancel: CancelToken,
        prompt: &str,
    ) -> (SessionState, Vec<StreamEvent>) {
        let mut events = Vec::new();
        let state = Session::new(model, context, params, cancel).run(prompt, |e| events.push(e));
        (state, events)
    }

    fn fragments(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TokenProduced(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn response(events: &[StreamEvent]) -> &Response {
        match events.last() {
            Some(StreamEvent::Completed(r)) => r,
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn test_generates_until_end_of_generation() {
        // tokens: 3='H' 4='i' 5='!'
        let model = model("Hi!");
        let mut context = FakeContext::new(&[3, 4, 5, EOS], model.vocab.n_tokens());

        let (state, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "Hi",

        );

        assert_eq!(state, SessionState::Completed);
        let response = response(&events);
        assert_eq!(response.text, "Hi!");
        assert_eq!(fragments(&events), "Hi!");
        assert_eq!(response.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(response.prompt_tokens, 3);
        assert_eq!(response.generated_tokens, 3);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(context.n_past, 6);
    }

    #[test]
    fn test_max_tokens_skips_trailing_decode() {
        let model = model("ab");
        let mut context = FakeContext::new(&[3, 4, 3, 4, 3, 4], model.vocab.n_tokens());

        let params = GenerationParams::default().max_tokens(3);
        let (_, events) = run(&model, &mut context, params, CancelToken::new(), "a");

        let response = response(&events);
        assert_eq!(response.text, "aba");
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        // prefill plus two steps
        assert_eq!(context.decodes, 3);
    }

    #[test]
    fn test_zero_max_tokens_generates_nothing() {
        let model = model("a");
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());

        let params = GenerationParams::default().max_tokens(0);
        let (state, events) = run(&model, &mut context, params, CancelToken::new(), "a");

        assert_eq!(state, SessionState::Completed);
        assert_eq!(events.len(), 1);
        assert_eq!(response(&events).stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_context_full() {
        let model = model("a");
        let mut context = FakeContext::new(&[3; 16], model.vocab.n_tokens());
        context.n_ctx = 4;

        let (_, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "aa",

        );

        let response = response(&events);
        assert_eq!(response.stop_reason, StopReason::ContextFull);
        assert_eq!(response.text, "aa");
        assert_eq!(context.n_past, 4);
    }

    #[test]
    fn test_decode_failure_keeps_partial_text() {
        let model = model("xy");
        let mut context = FakeContext::new(&[3, 4, 3, 4], model.vocab.n_tokens());
        context.fail_at = Some(2);

        let (state, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "x",

        );

        assert_eq!(state, SessionState::Completed);
        let response = response(&events);
        assert_eq!(response.text, "xy");
        assert!(matches!(response.stop_reason, StopReason::DecodeFailed(_)));
    }

    #[test]
    fn test_prefill_failure_emits_only_failed() {
        let model = model("a");
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());
        context.fail_at = Some(0);

        let (state, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "a",

        );

        assert_eq!(state, SessionState::Failed);
        let failure = InferenceError::Decode("scripted failure".to_string());
        assert_eq!(events, vec![StreamEvent::Failed(failure)]);
    }

    #[test]
    fn test_prompt_over_capacity() {
        let model = model("a");
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());

        let params = GenerationParams::default().batch_capacity(2);
        let (state, events) = run(&model, &mut context, params, CancelToken::new(), "aaaa");

        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            events,
            vec![StreamEvent::Failed(InferenceError::CapacityExceeded {
                requested: 5,
                capacity: 2
            })]
        );
        assert_eq!(context.decodes, 0);
    }

    #[test]
    fn test_prompt_too_large_fails_before_tokenizing() {
        let model = model("a");
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());

        let params = GenerationParams::default().batch_capacity(1);
        let prompt = "a".repeat(300);
        let (state, events) = run(&model, &mut context, params, CancelToken::new(), &prompt);

        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Failed(InferenceError::Tokenization(m))] if m.contains("prompt too large")
        ));
        assert_eq!(context.decodes, 0);
    }

    #[test]
    fn test_empty_prompt_fails_tokenization() {
        let mut vocabulary = vocabulary("a");
        vocabulary.add_bos = false;
        let model = FakeModel {
            meta: ModelMeta::default(),
            vocab: Box::new(SentencePieceTokenizer::new(vocabulary)),
        };
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());

        let (state, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "",

        );

        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Failed(InferenceError::Tokenization(_))]
        ));
        assert_eq!(context.decodes, 0);
    }

    #[test]
    fn test_cancel_before_start() {
        let model = model("a");
        let mut context = FakeContext::new(&[3], model.vocab.n_tokens());
        let cancel = CancelToken::new();
        cancel.cancel();

        let (state, events) = run(&model, &mut context, GenerationParams::default(), cancel, "a");

        assert_eq!(state, SessionState::Cancelled);
        let response = response(&events);
        assert_eq!(response.text, "");
        assert_eq!(response.stop_reason, StopReason::Cancelled);
        assert_eq!(context.decodes, 0);
    }

    #[test]
    fn test_cancel_mid_generation_stops_after_current_token() {
        let model = model("a");
        let mut context = FakeContext::new(&[3; 32], model.vocab.n_tokens());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();

        let mut events = Vec::new();
        let state = Session::new(&model, &mut context, GenerationParams::default(), cancel).run(
            "a",
            |e| {
                if matches!(e, StreamEvent::TokenProduced(_)) {
                    trigger.cancel();
                }
                events.push(e);
            },
        );

        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(fragments(&events), "a");
        assert_eq!(response(&events).stop_reason, StopReason::Cancelled);
        // prefill plus the one step already requested
        assert_eq!(context.decodes, 2);
    }

    #[test]
    fn test_dirty_context_is_cleared() {
        let model = model("a");
        let mut context = FakeContext::new(&[3, EOS, 3, EOS], model.vocab.n_tokens());
        context.n_past = 7;

        let (state, _) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "a",

        );

        assert_eq!(state, SessionState::Completed);
        assert_eq!(context.cleared, 1);
    }

    #[test]
    fn test_multibyte_character_over_two_tokens() {
        // vocabulary with byte tokens for "é" (0xC3 0xA9)
        let mut vocabulary = Vocabulary::new(
            ["<unk>", "<s>", "</s>", "<0xC3>", "<0xA9>", "a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        vocabulary.bos_token = Some(TokenId(1));
        vocabulary.eos_token = Some(TokenId(EOS));
        vocabulary.add_space_prefix = false;
        vocabulary.set_type(TokenId(1), TokenType::Control);
        vocabulary.set_type(TokenId(2), TokenType::Control);
        vocabulary.set_type(TokenId(3), TokenType::Byte);
        vocabulary.set_type(TokenId(4), TokenType::Byte);
        let model = FakeModel {
            meta: ModelMeta::default(),
            vocab: Box::new(SentencePieceTokenizer::new(vocabulary)),
        };
        let mut context = FakeContext::new(&[5, 3, 4, 5, EOS], 6);

        let (_, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "a",

        );

        assert_eq!(
            events[..3],
            [
                StreamEvent::TokenProduced("a".to_string()),
                StreamEvent::TokenProduced("é".to_string()),
                StreamEvent::TokenProduced("a".to_string()),
            ]
        );
        assert_eq!(response(&events).text, "aéa");
        assert_eq!(response(&events).generated_tokens, 4);
    }

    /// Byte-level vocabulary whose `aâ` piece ends in a lone UTF-8 lead byte.
    fn split_character_model() -> FakeModel {
        let mut vocabulary = Vocabulary::new(
            ["a", "a\u{e2}", "<|endoftext|>"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        );
        vocabulary.eos_token = Some(TokenId(EOS));
        vocabulary.set_type(TokenId(EOS), TokenType::Control);
        FakeModel {
            meta: ModelMeta::default(),
            vocab: Box::new(BpeTokenizer::new(vocabulary).unwrap()),
        }
    }

    fn produced(events: &[StreamEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::TokenProduced(_)))
            .count()
    }

    #[test]
    fn test_incomplete_tail_at_max_tokens_stays_in_one_event() {
        let model = split_character_model();
        let mut context = FakeContext::new(&[1], 3);
        let params = GenerationParams::default().max_tokens(1);

        let (_, events) = run(&model, &mut context, params, CancelToken::new(), "a");

        assert_eq!(produced(&events), 1);
        assert_eq!(
            events[0],
            StreamEvent::TokenProduced("a\u{fffd}".to_string())
        );
        let response = response(&events);
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        assert_eq!(response.generated_tokens, 1);
        assert_eq!(response.text, fragments(&events));
    }

    #[test]
    fn test_incomplete_tail_at_end_of_generation_stays_in_one_event() {
        let model = split_character_model();
        let mut context = FakeContext::new(&[1, EOS], 3);

        let (_, events) = run(

            &model,

            &mut context,

            GenerationParams::default(),

            CancelToken::new(),

            "a",

        );

        assert_eq!(produced(&events), 1);
        let response = response(&events);
        assert_eq!(response.stop_reason, StopReason::EndOfGeneration);
        assert_eq!(response.generated_tokens, 1);
        assert_eq!(response.text, "a\u{fffd}");
        assert_eq!(response.text, fragments(&events));
    }
}

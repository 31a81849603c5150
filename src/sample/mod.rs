use crate::core::{InferenceError, Result, TokenId};

/// Picks the highest-scoring token.
///
/// Ties go to the lowest index and NaN scores never win.
pub fn greedy(logits: &[f32]) -> Result<TokenId> {
    let mut best: Option<(usize, f32)> = None;

    for (i, &logit) in logits.iter().enumerate() {
        if logit.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, top)| logit > top) {
            best = Some((i, logit));
        }
    }

    best.map(|(i, _)| TokenId::from(i)).ok_or_else(|| {
        InferenceError::Sampling(if logits.is_empty() {
            "empty logits".to_string()
        } else {
            format!("no finite logits among {}", logits.len())
        })
    })
}

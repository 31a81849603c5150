use crate::core::{InferenceError, Result, TokenId};

pub const DEFAULT_BATCH_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: usize,
    pub seq_id: SeqId,
    /// Compute the output distribution for this entry.
    pub logits: bool,
}

/// One unit of work for a decode call.
///
/// Entry count never exceeds the capacity fixed at construction, and
/// positions of one sequence are contiguous and increasing.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Whole prompt in sequence 0 at positions `0..len`, logits on the last
    /// entry only.
    pub fn prefill(tokens: &[TokenId], capacity: usize) -> Result<Self> {
        if tokens.is_empty() {
            return Err(InferenceError::Tokenization(
                "prompt produced no tokens".to_string(),
            ));
        }
        if tokens.len() > capacity {
            return Err(InferenceError::CapacityExceeded {
                requested: tokens.len(),
                capacity,
            });
        }

        let mut batch = Self::with_capacity(capacity);
        let last = tokens.len() - 1;
        for (pos, &token) in tokens.iter().enumerate() {
            batch.push(BatchEntry {
                token,
                pos,
                seq_id: SeqId(0),
                logits: pos == last,
            })?;
        }
        Ok(batch)
    }

    /// Single entry with logits, used for every decode after the prefill.
    pub fn step(token: TokenId, pos: usize) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos,
                seq_id: SeqId(0),
                logits: true,
            }],
            capacity: 1,
        }
    }

    pub fn push(&mut self, entry: BatchEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(InferenceError::CapacityExceeded {
                requested: self.entries.len() + 1,
                capacity: self.capacity,
            });
        }

        let previous = self
            .entries
            .iter()
            .rev()
            .find(|e| e.seq_id == entry.seq_id);
        if let Some(prev) = previous {
            if entry.pos != prev.pos + 1 {
                return Err(InferenceError::Decode(format!(
                    "position {} does not follow {} in sequence {}",
                    entry.pos, prev.pos, entry.seq_id.0
                )));
            }
        }

        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().map(|e| e.token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn first_pos(&self) -> Option<usize> {
        self.entries.first().map(|e| e.pos)
    }

    /// Highest slot that requested logits; sampling reads from here.
    pub fn last_logits_slot(&self) -> Option<usize> {
        self.entries.iter().rposition(|e| e.logits)
    }
}

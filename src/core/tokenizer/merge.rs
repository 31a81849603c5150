use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Range;

struct Symbol {
    range: Range<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Candidate<K> {
    key: K,
    left: usize,
    right: usize,
    len: usize,
}

impl<K: Ord> Ord for Candidate<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.left.cmp(&self.left))
    }
}

impl<K: Ord> PartialOrd for Candidate<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> PartialEq for Candidate<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for Candidate<K> {}

/// Pair merging over a linked list of symbols, each a byte range of `text`.
///
/// `key` sees the joined text of two neighbours and the offset where the
/// right one starts; `None` means the pair never merges. The greatest key
/// merges first, the leftmost pair on ties. Every merge queues at most two new
/// pairs, so the whole pass is `O(n log n)` in the number of units.
pub(crate) fn merge_pairs<K, F>(text: &str, units: Vec<Range<usize>>, key: F) -> Vec<Range<usize>>
where
    K: Ord,
    F: Fn(&str, usize) -> Option<K>,
{
    let count = units.len();
    let mut symbols: Vec<Symbol> = units
        .into_iter()
        .enumerate()
        .map(|(i, range)| Symbol {
            range,
            prev: i.checked_sub(1),
            next: (i + 1 < count).then_some(i + 1),
        })
        .collect();

    let candidate = |symbols: &[Symbol], left: usize, right: usize| {
        let (l, r) = (&symbols[left].range, &symbols[right].range);
        key(&text[l.start..r.end], l.len()).map(|key| Candidate {
            key,
            left,
            right,
            len: r.end - l.start,
        })
    };

    let mut queue = BinaryHeap::new();
    for right in 1..symbols.len() {
        queue.extend(candidate(&symbols, right - 1, right));
    }

    while let Some(Candidate {
        left, right, len, ..
    }) = queue.pop()
    {
        let (l, r) = (&symbols[left], &symbols[right]);
        // one side changed since the pair was queued
        if l.next != Some(right) || r.range.is_empty() || r.range.end - l.range.start != len {
            continue;
        }

        let end = r.range.end;
        let next = r.next;
        symbols[left].range.end = end;
        symbols[left].next = next;
        symbols[right].range.start = end;
        if let Some(n) = next {
            symbols[n].prev = Some(left);
        }

        if let Some(p) = symbols[left].prev {
            queue.extend(candidate(&symbols, p, left));
        }
        if let Some(n) = next {
            queue.extend(candidate(&symbols, left, n));
        }
    }

    let mut merged = Vec::new();
    let mut at = (!symbols.is_empty()).then_some(0);
    while let Some(i) = at {
        merged.push(symbols[i].range.clone());
        at = symbols[i].next;
    }
    merged
}

/// Byte range of every character of `text`.
pub(crate) fn char_units(text: &str) -> Vec<Range<usize>> {
    text.char_indices()
        .map(|(i, c)| i..i + c.len_utf8())
        .collect()
}

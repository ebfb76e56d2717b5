//! Sequence spans: contiguous row ranges treated as independent sequences.

use crate::api::error::{NetError, NetResult};

/// Sorted, non-overlapping `(start, len)` ranges inside `[0, total)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSpans {
    spans: Vec<(usize, usize)>,
    total: usize,
}

impl SequenceSpans {
    /// One span covering every row.
    pub fn whole(total: usize) -> Self {
        let spans = if total == 0 { Vec::new() } else { vec![(0, total)] };
        Self { spans, total }
    }

    /// Spans from sequence start indices; each span runs to the next start
    /// (or the end). `[0, 3, 7]` over 10 rows gives `(0,3) (3,4) (7,3)`.
    ///
    /// Starts must be strictly increasing, begin at 0 and lie below `total`.
    pub fn from_starts(starts: &[usize], total: usize) -> NetResult<Self> {
        if starts.is_empty() {
            return Err(NetError::InvalidArgument("sequence starts must not be empty".into()));
        }
        if starts[0] != 0 {
            return Err(NetError::InvalidArgument(format!("first sequence must start at 0, got {}", starts[0])));
        }
        for w in starts.windows(2) {
            if w[1] <= w[0] {
                return Err(NetError::InvalidArgument(format!(
                    "sequence starts must be strictly increasing ({} then {})",
                    w[0], w[1]
                )));
            }
        }
        let last = starts[starts.len() - 1];
        if last >= total {
            return Err(NetError::InvalidArgument(format!("sequence start {} outside {} rows", last, total)));
        }
        let spans = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let end = starts.get(i + 1).copied().unwrap_or(total);
                (s, end - s)
            })
            .collect();
        Ok(Self { spans, total })
    }

    /// Validates explicit `(start, len)` spans. Gaps between spans are allowed.
    pub fn from_spans(spans: Vec<(usize, usize)>, total: usize) -> NetResult<Self> {
        let mut prev_end = 0usize;
        for (i, &(start, len)) in spans.iter().enumerate() {
            if len == 0 {
                return Err(NetError::InvalidArgument(format!("span {} is empty", i)));
            }
            if i > 0 && start < prev_end {
                return Err(NetError::InvalidArgument(format!(
                    "span {} starting at {} overlaps or precedes the previous span ending at {}",
                    i, start, prev_end
                )));
            }
            let end = start
                .checked_add(len)
                .ok_or_else(|| NetError::InvalidArgument(format!("span {} overflows", i)))?;
            if end > total {
                return Err(NetError::InvalidArgument(format!(
                    "span {} ({}..{}) exceeds {} rows",
                    i, start, end, total
                )));
            }
            prev_end = end;
        }
        Ok(Self { spans, total })
    }

    pub fn as_slice(&self) -> &[(usize, usize)] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Row count the spans were validated against.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.spans.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_starts_example() {
        let spans = SequenceSpans::from_starts(&[0, 3, 7], 10).unwrap();
        assert_eq!(spans.as_slice(), &[(0, 3), (3, 4), (7, 3)]);
    }

    #[test]
    fn test_from_starts_rejects_bad_input() {
        assert!(SequenceSpans::from_starts(&[0, 3, 3], 10).is_err());
        assert!(SequenceSpans::from_starts(&[0, 5, 2], 10).is_err());
        assert!(SequenceSpans::from_starts(&[0, 10], 10).is_err());
        assert!(SequenceSpans::from_starts(&[1, 4], 10).is_err());
        assert!(SequenceSpans::from_starts(&[], 10).is_err());
    }

    #[test]
    fn test_from_spans() {
        assert!(SequenceSpans::from_spans(vec![(0, 2), (4, 3)], 7).is_ok());
        assert!(SequenceSpans::from_spans(vec![(0, 3), (2, 3)], 7).is_err());
        assert!(SequenceSpans::from_spans(vec![(5, 3)], 7).is_err());
        assert!(SequenceSpans::from_spans(vec![(0, 0)], 7).is_err());
    }

    #[test]
    fn test_whole() {
        assert_eq!(SequenceSpans::whole(5).as_slice(), &[(0, 5)]);
        assert!(SequenceSpans::whole(0).is_empty());
    }
}

//! Row Batching
//!
//! Several rows can share one token when a single logical update spans more
//! than one row. On the wire only the last row of such a group carries the
//! token; the rows before it carry the `_` marker so a receiver never commits
//! a partially delivered group.

use std::sync::Arc;

use super::stream::StreamUpdate;
use super::token::StreamToken;

/// Replace the token of every entry that is followed by an entry with the
/// same token with `None`.
///
/// ```text
/// [(1, a), (1, b), (2, c), (3, d), (3, e)]
///   -> [(None, a), (Some(1), b), (Some(2), c), (None, d), (Some(3), e)]
/// ```
///
/// The last entry always keeps its token.
pub fn batch_updates<T: PartialEq, P>(updates: Vec<(T, P)>) -> Vec<(Option<T>, P)> {
    let mut batched = Vec::with_capacity(updates.len());
    let mut iter = updates.into_iter().peekable();

    while let Some((token, payload)) = iter.next() {
        let continues = iter.peek().is_some_and(|(next, _)| *next == token);
        batched.push((if continues { None } else { Some(token) }, payload));
    }

    batched
}

/// A row ready for fan-out
///
/// Keeps the row's real token alongside the wire token so connections can
/// discard rows they already received during catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedUpdate {
    /// Token of the row
    pub token: StreamToken,
    /// Token written on the wire (`None` = more rows follow under `token`)
    pub wire_token: Option<StreamToken>,
    /// Serialized row
    pub payload: Arc<str>,
}

impl BatchedUpdate {
    /// Batch an ordered run of updates from one stream
    #[must_use]
    pub fn from_updates(updates: Vec<StreamUpdate>) -> Vec<Self> {
        let tokens: Vec<StreamToken> = updates.iter().map(|u| u.token).collect();
        let pairs = updates.into_iter().map(|u| (u.token, u.payload)).collect();

        batch_updates(pairs)
            .into_iter()
            .zip(tokens)
            .map(|((wire_token, payload), token)| Self {
                token,
                wire_token,
                payload,
            })
            .collect()
    }

    /// Whether a receiver may commit after this row
    #[must_use]
    pub fn is_commit_point(&self) -> bool {
        self.wire_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_batch_mixed_tokens() {
        let updates = vec![(1, "a"), (1, "b"), (2, "c"), (3, "d"), (3, "e")];
        assert_eq!(
            batch_updates(updates),
            vec![
                (None, "a"),
                (Some(1), "b"),
                (Some(2), "c"),
                (None, "d"),
                (Some(3), "e"),
            ]
        );
    }

    #[test]
    fn test_batch_empty() {
        let updates: Vec<(i64, &str)> = Vec::new();
        assert!(batch_updates(updates).is_empty());
    }

    #[test]
    fn test_batch_single() {
        assert_eq!(batch_updates(vec![(7, "x")]), vec![(Some(7), "x")]);
    }

    #[test]
    fn test_batch_all_same_token() {
        let batched = batch_updates(vec![(5, 'a'), (5, 'b'), (5, 'c')]);
        assert_eq!(batched, vec![(None, 'a'), (None, 'b'), (Some(5), 'c')]);
    }

    #[test]
    fn test_batched_update_keeps_real_token() {
        let updates = vec![
            StreamUpdate::new(StreamToken::new(3), "[1]"),
            StreamUpdate::new(StreamToken::new(3), "[2]"),
            StreamUpdate::new(StreamToken::new(4), "[3]"),
        ];

        let batched = BatchedUpdate::from_updates(updates);

        assert_eq!(batched.len(), 3);
        assert_eq!(batched[0].token, StreamToken::new(3));
        assert_eq!(batched[0].wire_token, None);
        assert!(!batched[0].is_commit_point());
        assert_eq!(batched[1].wire_token, Some(StreamToken::new(3)));
        assert_eq!(batched[2].wire_token, Some(StreamToken::new(4)));
        assert_eq!(&*batched[2].payload, "[3]");
    }
}

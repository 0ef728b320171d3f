//! The pre-enumerated "suggested question" set.
//!
//! Questions in this set get user-independent replay cache keys, so one
//! produced answer serves every caller. The set is explicit application
//! state: loaded once at startup and swapped wholesale by `reload`, never
//! mutated in place.

use std::collections::HashSet;
use std::sync::RwLock;

/// Strip the punctuation and whitespace that vary between typed and
/// transcribed renditions of the same question.
pub fn normalize_question(q: &str) -> String {
    q.trim()
        .trim_end_matches(['？', '?', '。', '.', '>'])
        .trim()
        .to_lowercase()
}

/// Application-scoped suggested-question set.
#[derive(Default)]
pub struct SuggestedSet {
    inner: RwLock<HashSet<String>>,
}

impl SuggestedSet {
    pub fn new<I, S>(questions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = Self::default();
        set.reload(questions);
        set
    }

    /// Replace the whole set atomically.
    pub fn reload<I, S>(&self, questions: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next: HashSet<String> = questions
            .into_iter()
            .map(|q| normalize_question(q.as_ref()))
            .filter(|q| !q.is_empty())
            .collect();
        let count = next.len();
        *self.inner.write().expect("suggested set lock poisoned") = next;
        count
    }

    pub fn contains(&self, question: &str) -> bool {
        self.inner
            .read()
            .expect("suggested set lock poisoned")
            .contains(&normalize_question(question))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("suggested set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_ignores_trailing_punctuation_and_case() {
        let set = SuggestedSet::new(["What are your opening hours?"]);
        assert!(set.contains("what are your opening hours"));
        assert!(set.contains("What are your opening hours？"));
        assert!(set.contains("  what are your opening hours。 "));
        assert!(!set.contains("what are your opening hours tomorrow"));
    }

    #[test]
    fn reload_replaces_not_merges() {
        let set = SuggestedSet::new(["old question"]);
        let n = set.reload(["new question", "", "another one?"]);
        assert_eq!(n, 2);
        assert!(!set.contains("old question"));
        assert!(set.contains("another one"));
    }
}

//! Instrumentation bookkeeping: keys, the concurrent registry, and the
//! applied-pattern history used for removed-method accounting.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::pattern_set::PatternSet;

/// Identity token of a class loader; 0 is the bootstrap loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoaderId(pub i64);

/// A class as seen across loader boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassIdentity {
    pub class_name: String,
    pub loader: LoaderId,
}

/// Identifies one instrumented method uniquely across class loaders.
///
/// `method` is the method name plus its descriptor, so overloads are
/// distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentationKey {
    pub class_name: String,
    pub loader: LoaderId,
    pub method: String,
}

impl InstrumentationKey {
    pub fn class_identity(&self) -> ClassIdentity {
        ClassIdentity {
            class_name: self.class_name.clone(),
            loader: self.loader,
        }
    }
}

/// Thread-safe set of instrumentation keys.
///
/// Registration happens concurrently from the class-file load hook while a
/// batch retransform is in flight; reads take a snapshot and iterate outside
/// the lock.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<HashSet<InstrumentationKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert. Empty class or method names are ignored.
    pub fn register(&self, key: InstrumentationKey) {
        if key.class_name.is_empty() || key.method.is_empty() {
            return;
        }
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &InstrumentationKey) -> bool {
        self.keys.read().map(|k| k.contains(key)).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<InstrumentationKey> {
        self.keys
            .read()
            .map(|k| k.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Ordered sequence of previously applied pattern sets.
///
/// Entries are shared (`Arc`) because the set most recently applied is also
/// the one the class-file load hook consults while a retransform is in
/// flight. Grows monotonically while the session is instrumented; cleared on
/// full deinstrumentation. Only the session controller thread mutates it.
#[derive(Debug, Default)]
pub struct PatternHistory {
    entries: Vec<Arc<PatternSet>>,
}

impl PatternHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, set: Arc<PatternSet>) {
        self.entries.push(set);
    }

    pub fn last(&self) -> Option<&Arc<PatternSet>> {
        self.entries.last()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternSet> {
        self.entries.iter().map(|s| s.as_ref())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Every class identity touched by any entry in history.
    pub fn touched_classes(&self) -> Vec<ClassIdentity> {
        let mut seen: HashSet<ClassIdentity> = HashSet::new();
        for set in &self.entries {
            for key in set.registry().snapshot() {
                seen.insert(key.class_identity());
            }
        }
        seen.into_iter().collect()
    }
}

/// Count how many previously-instrumented methods belong to the given
/// unloaded or reverted classes.
///
/// Pure function over the history: unions all keys across every applied
/// pattern set, then counts those whose class identity is listed. This keeps
/// "N methods removed" reporting accurate without reflecting over live
/// classes at report time.
pub fn count_removed<'a>(
    history: impl IntoIterator<Item = &'a PatternSet>,
    removed: &[ClassIdentity],
) -> usize {
    let removed: HashSet<&ClassIdentity> = removed.iter().collect();
    let mut union: HashSet<InstrumentationKey> = HashSet::new();
    for set in history {
        for key in set.registry().snapshot() {
            union.insert(key);
        }
    }
    union
        .iter()
        .filter(|key| removed.contains(&key.class_identity()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern_set::PatternSet;
    use metracer_protocol::StackTraceMode;

    fn set(class: &str) -> PatternSet {
        PatternSet::compile(class, None, StackTraceMode::Disabled).unwrap()
    }

    fn identity(class: &str) -> ClassIdentity {
        ClassIdentity {
            class_name: class.to_string(),
            loader: LoaderId(0),
        }
    }

    #[test]
    fn test_registration_is_idempotent() {
        let s = set(".*");
        s.register_instrumented(LoaderId(0), "a.B", "m()V");
        s.register_instrumented(LoaderId(0), "a.B", "m()V");
        assert_eq!(s.instrumented_count(), 1);
    }

    #[test]
    fn test_empty_names_are_not_registered() {
        let s = set(".*");
        s.register_instrumented(LoaderId(0), "", "m()V");
        s.register_instrumented(LoaderId(0), "a.B", "");
        assert_eq!(s.instrumented_count(), 0);
    }

    #[test]
    fn test_same_method_under_different_loaders_is_two_keys() {
        let s = set(".*");
        s.register_instrumented(LoaderId(1), "a.B", "m()V");
        s.register_instrumented(LoaderId(2), "a.B", "m()V");
        assert_eq!(s.instrumented_count(), 2);
    }

    #[test]
    fn test_count_removed_is_additive_across_history() {
        // Class A instrumented twice with two different method pairs.
        let first = set("A");
        first.register_instrumented(LoaderId(0), "a.A", "m1()V");
        first.register_instrumented(LoaderId(0), "a.A", "m2()V");
        let second = set("A2");
        second.register_instrumented(LoaderId(0), "a.A", "m3()V");
        second.register_instrumented(LoaderId(0), "a.A", "m4()V");

        let mut history = PatternHistory::new();
        history.push(Arc::new(first));
        history.push(Arc::new(second));

        assert_eq!(count_removed(history.iter(), &[identity("a.A")]), 4);
        assert_eq!(count_removed(history.iter(), &[identity("a.B")]), 0);
    }

    #[test]
    fn test_count_removed_unions_duplicate_keys() {
        let first = set("A");
        first.register_instrumented(LoaderId(0), "a.A", "m1()V");
        let second = set("A2");
        second.register_instrumented(LoaderId(0), "a.A", "m1()V");

        let mut history = PatternHistory::new();
        history.push(Arc::new(first));
        history.push(Arc::new(second));

        // The same key re-instrumented under a later pattern set still counts
        // as one removed method.
        assert_eq!(count_removed(history.iter(), &[identity("a.A")]), 1);
    }

    #[test]
    fn test_touched_classes_spans_history() {
        let first = set("A");
        first.register_instrumented(LoaderId(0), "a.A", "m1()V");
        let second = set("B");
        second.register_instrumented(LoaderId(3), "b.B", "m2()V");

        let mut history = PatternHistory::new();
        history.push(Arc::new(first));
        history.push(Arc::new(second));

        let mut touched = history.touched_classes();
        touched.sort_by(|a, b| a.class_name.cmp(&b.class_name));
        assert_eq!(touched.len(), 2);
        assert_eq!(touched[0].class_name, "a.A");
        assert_eq!(touched[1].loader, LoaderId(3));
    }
}

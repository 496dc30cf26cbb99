//! Compiled pattern pairs and class/method match evaluation.

use std::hash::{Hash, Hasher};

use metracer_protocol::{MethodRef, StackTraceMode};
use regex::Regex;

use crate::error::{PatternError, Result};
use crate::registry::{InstrumentationKey, KeyRegistry, LoaderId};

/// Class-name prefixes the engine refuses to instrument.
///
/// Instrumenting the tracer's own support classes would make every probe
/// re-enter itself; the check runs before any pattern is consulted, so even
/// `.*` cannot reach these.
pub const BLACKLISTED_PREFIXES: &[&str] = &["io.metracer."];

/// A compiled, immutable pattern pair plus the registry of methods it has
/// actually instrumented.
///
/// Equality and hashing are structural over the pattern source text and the
/// stack-trace mode; the registry is bookkeeping, not identity.
#[derive(Debug)]
pub struct PatternSet {
    class_source: String,
    method_source: Option<String>,
    class_regex: Regex,
    method_regex: Option<Regex>,
    stack_trace_mode: StackTraceMode,
    registry: KeyRegistry,
}

impl PatternSet {
    /// Compile and validate a pattern pair.
    ///
    /// Fails fast with a descriptive error naming the offending text; no
    /// state is created on failure.
    pub fn compile(
        class_pattern: &str,
        method_pattern: Option<&str>,
        stack_trace_mode: StackTraceMode,
    ) -> Result<PatternSet> {
        if class_pattern.trim().is_empty() {
            return Err(PatternError::EmptyClassPattern);
        }
        let class_regex = Regex::new(class_pattern).map_err(|e| PatternError::Malformed {
            pattern: class_pattern.to_string(),
            reason: e.to_string(),
        })?;
        let method_regex = match method_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| PatternError::Malformed {
                pattern: p.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };
        Ok(PatternSet {
            class_source: class_pattern.to_string(),
            method_source: method_pattern.map(|p| p.to_string()),
            class_regex,
            method_regex,
            stack_trace_mode,
            registry: KeyRegistry::new(),
        })
    }

    /// Unanchored "contains" match against the fully-qualified class name.
    /// Blacklisted namespaces never match, regardless of the pattern.
    pub fn is_class_matched(&self, fqcn: &str) -> bool {
        if fqcn.is_empty() {
            return false;
        }
        if BLACKLISTED_PREFIXES.iter().any(|p| fqcn.starts_with(p)) {
            return false;
        }
        self.class_regex.is_match(fqcn)
    }

    /// Method-level match, evaluated lazily per method against
    /// `fqcn::method`. A set without a method pattern matches every method
    /// of a matching class.
    pub fn is_method_matched(&self, fqcn: &str, method_name: &str) -> bool {
        if !self.is_class_matched(fqcn) {
            return false;
        }
        match &self.method_regex {
            None => true,
            Some(re) => {
                let key = MethodRef {
                    class: fqcn.to_string(),
                    method: method_name.to_string(),
                };
                re.is_match(&key.encode())
            }
        }
    }

    /// Record that a method was actually rewritten under this pattern set.
    /// Thread-safe and idempotent; empty names are ignored.
    pub fn register_instrumented(&self, loader: LoaderId, fqcn: &str, method: &str) {
        self.registry.register(InstrumentationKey {
            class_name: fqcn.to_string(),
            loader,
            method: method.to_string(),
        });
    }

    pub fn instrumented_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn class_pattern(&self) -> &str {
        &self.class_source
    }

    pub fn method_pattern(&self) -> Option<&str> {
        self.method_source.as_deref()
    }

    pub fn stack_trace_mode(&self) -> StackTraceMode {
        self.stack_trace_mode
    }
}

impl PartialEq for PatternSet {
    fn eq(&self, other: &Self) -> bool {
        self.class_source == other.class_source
            && self.method_source == other.method_source
            && self.stack_trace_mode == other.stack_trace_mode
    }
}

impl Eq for PatternSet {}

impl Hash for PatternSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_source.hash(state);
        self.method_source.hash(state);
        self.stack_trace_mode.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(class: &str, method: Option<&str>) -> PatternSet {
        PatternSet::compile(class, method, StackTraceMode::Disabled).unwrap()
    }

    #[test]
    fn test_empty_class_pattern_rejected() {
        assert!(matches!(
            PatternSet::compile("", None, StackTraceMode::Disabled),
            Err(PatternError::EmptyClassPattern)
        ));
        assert!(matches!(
            PatternSet::compile("   ", None, StackTraceMode::Disabled),
            Err(PatternError::EmptyClassPattern)
        ));
    }

    #[test]
    fn test_malformed_pattern_names_offending_text() {
        let err = PatternSet::compile("[invalid", None, StackTraceMode::Disabled).unwrap_err();
        match err {
            PatternError::Malformed { pattern, .. } => assert_eq!(pattern, "[invalid"),
            other => panic!("unexpected error: {:?}", other),
        }
        let err =
            PatternSet::compile("ok", Some("(broken"), StackTraceMode::Disabled).unwrap_err();
        match err {
            PatternError::Malformed { pattern, .. } => assert_eq!(pattern, "(broken"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_class_match_is_contains_semantics() {
        let s = compile("app", None);
        assert!(s.is_class_matched("com.app.Worker"));
        assert!(s.is_class_matched("app"));
        assert!(!s.is_class_matched("com.App.Worker"), "case-sensitive");
        assert!(!s.is_class_matched(""));
    }

    #[test]
    fn test_anchored_pattern_still_works() {
        let s = compile("^com\\.app\\.", None);
        assert!(s.is_class_matched("com.app.Worker"));
        assert!(!s.is_class_matched("org.com.app.Worker"));
    }

    #[test]
    fn test_blacklist_wins_over_permissive_pattern() {
        let s = compile(".*", None);
        assert!(s.is_class_matched("com.app.Worker"));
        assert!(!s.is_class_matched("io.metracer.Probe"));
    }

    #[test]
    fn test_method_match_requires_class_match() {
        let s = compile("com\\.app", Some("doWork"));
        assert!(s.is_method_matched("com.app.Worker", "doWork"));
        assert!(!s.is_method_matched("com.other.Worker", "doWork"));
        assert!(!s.is_method_matched("com.app.Worker", "idle"));
    }

    #[test]
    fn test_absent_method_pattern_matches_all_methods() {
        let s = compile("com\\.app", None);
        assert!(s.is_method_matched("com.app.Worker", "anything"));
    }

    #[test]
    fn test_method_pattern_sees_qualified_form() {
        // The method pattern runs against `fqcn::method`, so it can pin the
        // class side too.
        let s = compile(".", Some("Worker::doWork"));
        assert!(s.is_method_matched("com.app.Worker", "doWork"));
        assert!(!s.is_method_matched("com.app.Manager", "doWork"));
    }

    #[test]
    fn test_equality_is_structural() {
        let a = compile("x", Some("y"));
        let b = compile("x", Some("y"));
        let c = compile("x", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            a,
            PatternSet::compile("x", Some("y"), StackTraceMode::Print).unwrap()
        );
        // Registry contents do not affect equality.
        a.register_instrumented(LoaderId(0), "a.B", "m()V");
        assert_eq!(a, b);
    }
}

//! Patterns-file format: one `Class::method` pair per line.
//!
//! Blank lines and `#`-prefixed lines are ignored. Any other malformed line
//! is a hard error and nothing is partially loaded. Consuming a file yields
//! exactly two derived patterns: an alternation of the distinct class names
//! and an alternation of the distinct `class::method` strings, each wrapped
//! in one capturing group.

use thiserror::Error;

/// One `Class::method` pair, the textual key form used by patterns files
/// and method-level matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub class: String,
    pub method: String,
}

impl MethodRef {
    /// `class::method`.
    pub fn encode(&self) -> String {
        format!("{}::{}", self.class, self.method)
    }

    /// Split at the first `::`. `None` when the separator is missing or
    /// either side is empty.
    pub fn decode(text: &str) -> Option<MethodRef> {
        let (class, method) = text.split_once("::")?;
        if class.is_empty() || method.is_empty() {
            return None;
        }
        Some(MethodRef {
            class: class.to_string(),
            method: method.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum PatternsFileError {
    #[error("line {line}: whitespace is not allowed in '{text}'")]
    Whitespace { line: usize, text: String },
    #[error("line {line}: expected Class::method, got '{text}'")]
    BadSeparator { line: usize, text: String },
    #[error("patterns file contains no entries")]
    Empty,
}

/// The two patterns derived from a patterns file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPatterns {
    /// `(classA|classB|...)` over distinct class names.
    pub class_pattern: String,
    /// `(classA::m1|classB::m2|...)` over distinct pairs.
    pub method_pattern: String,
}

/// Escape one name for use inside the derived alternation.
///
/// `.` and `$` keep their literal meaning; every other non-alphanumeric
/// character collapses to a `.` wildcard so shapes like inner-class
/// separators from foreign tools still match something sensible.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        match c {
            '.' => out.push_str("\\."),
            '$' => out.push_str("\\$"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            _ => out.push('.'),
        }
    }
    out
}

fn push_unique(items: &mut Vec<String>, candidate: String) {
    if !items.iter().any(|x| *x == candidate) {
        items.push(candidate);
    }
}

/// Parse the textual patterns-file content into its two derived patterns.
pub fn parse_patterns_file(text: &str) -> Result<DerivedPatterns, PatternsFileError> {
    let mut classes: Vec<String> = Vec::new();
    let mut pairs: Vec<String> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(PatternsFileError::Whitespace {
                line,
                text: trimmed.to_string(),
            });
        }
        let entry = match MethodRef::decode(trimmed) {
            // Decode splits at the first separator; a second one inside the
            // method side is still malformed here.
            Some(entry) if !entry.method.contains("::") => entry,
            _ => {
                return Err(PatternsFileError::BadSeparator {
                    line,
                    text: trimmed.to_string(),
                })
            }
        };
        push_unique(&mut classes, entry.class);
        push_unique(&mut pairs, trimmed.to_string());
    }

    if classes.is_empty() {
        return Err(PatternsFileError::Empty);
    }

    let class_pattern = format!(
        "({})",
        classes.iter().map(|c| escape(c)).collect::<Vec<_>>().join("|")
    );
    let method_pattern = format!(
        "({})",
        pairs.iter().map(|p| escape(p)).collect::<Vec<_>>().join("|")
    );
    Ok(DerivedPatterns {
        class_pattern,
        method_pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_ref_round_trips() {
        let key = MethodRef {
            class: "com.app.Worker".to_string(),
            method: "doWork".to_string(),
        };
        assert_eq!(MethodRef::decode(&key.encode()), Some(key));
    }

    #[test]
    fn test_method_ref_decodes_at_first_separator() {
        let key = MethodRef::decode("a.B::m::tail").unwrap();
        assert_eq!(key.class, "a.B");
        assert_eq!(key.method, "m::tail");
    }

    #[test]
    fn test_method_ref_rejects_empty_sides() {
        assert_eq!(MethodRef::decode("a.B"), None);
        assert_eq!(MethodRef::decode("::m"), None);
        assert_eq!(MethodRef::decode("a.B::"), None);
    }

    #[test]
    fn test_single_entry_has_no_alternation() {
        let derived = parse_patterns_file("a.B::m1\na.B::m1\n").unwrap();
        assert!(!derived.class_pattern.contains('|'), "duplicates must dedup");
        assert_eq!(derived.class_pattern, r"(a\.B)");
    }

    #[test]
    fn test_derived_method_pattern_matches_only_listed_method() {
        let derived = parse_patterns_file("a.B::m1\n").unwrap();
        let re = regex::Regex::new(&derived.method_pattern).unwrap();
        assert!(re.is_match("a.B::m1"));
        assert!(!re.is_match("a.B::m2"));
    }

    #[test]
    fn test_multiple_entries_alternate() {
        let derived = parse_patterns_file("a.B::m1\nc.D::m2\n").unwrap();
        assert_eq!(derived.class_pattern, r"(a\.B|c\.D)");
        let re = regex::Regex::new(&derived.method_pattern).unwrap();
        assert!(re.is_match("c.D::m2"));
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let derived = parse_patterns_file("# header\n\na.B::m1\n   \n").unwrap();
        assert_eq!(derived.class_pattern, r"(a\.B)");
    }

    #[test]
    fn test_whitespace_in_entry_is_hard_error() {
        let err = parse_patterns_file("a.B :: m1\n").unwrap_err();
        assert!(matches!(err, PatternsFileError::Whitespace { line: 1, .. }));
    }

    #[test]
    fn test_missing_separator_is_hard_error() {
        assert!(matches!(
            parse_patterns_file("a.B.m1\n").unwrap_err(),
            PatternsFileError::BadSeparator { .. }
        ));
        assert!(matches!(
            parse_patterns_file("::m1\n").unwrap_err(),
            PatternsFileError::BadSeparator { .. }
        ));
        assert!(matches!(
            parse_patterns_file("a.B::\n").unwrap_err(),
            PatternsFileError::BadSeparator { .. }
        ));
    }

    #[test]
    fn test_dollar_is_escaped_and_exotic_chars_collapse() {
        let derived = parse_patterns_file("a.B$Inner::m-x\n").unwrap();
        assert_eq!(derived.class_pattern, r"(a\.B\$Inner)");
        let re = regex::Regex::new(&derived.method_pattern).unwrap();
        assert!(re.is_match("a.B$Inner::m-x"));
        assert!(re.is_match("a.B$Inner::m_x"), "collapsed wildcard");
    }

    #[test]
    fn test_empty_file_is_an_error() {
        assert!(matches!(
            parse_patterns_file("# only comments\n").unwrap_err(),
            PatternsFileError::Empty
        ));
    }
}

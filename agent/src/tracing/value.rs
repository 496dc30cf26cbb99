//! Closed tagged representation of Java values crossing the probe boundary.
//!
//! The probe natives convert every incoming `jobject` into one of these
//! variants before formatting, so rendering is total: there is no reflective
//! deep-walk and no fallback path that can throw inside the traced thread.

use std::fmt;

/// Maximum container elements rendered before the `, ...` marker.
pub const MAX_RENDERED_ELEMENTS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Sentinel passed by void wrappers. Renders as `void` in exit lines and
    /// keeps a genuine `null` return (`Value::Null`) distinguishable.
    Void,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Array(Vec<Value>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Display form of a thrown object, e.g. `java.lang.IllegalStateException: boom`.
    Throwable(String),
    /// `toString()` of anything else.
    Other(String),
}

impl Value {
    /// Render the value the way it appears inside a trace line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Void => out.push_str("void"),
            Value::Bool(b) => {
                let _ = fmt::Write::write_fmt(out, format_args!("{}", b));
            }
            Value::Int(i) => {
                let _ = fmt::Write::write_fmt(out, format_args!("{}", i));
            }
            Value::Float(f) => {
                let _ = fmt::Write::write_fmt(out, format_args!("{}", f));
            }
            Value::Char(c) => out.push(*c),
            Value::Str(s) | Value::Throwable(s) | Value::Other(s) => out.push_str(s),
            Value::Array(items) | Value::List(items) => {
                out.push('[');
                for (i, item) in items.iter().take(MAX_RENDERED_ELEMENTS).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.render_into(out);
                }
                if items.len() > MAX_RENDERED_ELEMENTS {
                    out.push_str(", ...");
                }
                out.push(']');
            }
            Value::Map(entries) => {
                // Keyed containers use the same bracket delimiters as the
                // ordered ones; only the entry form differs.
                out.push('[');
                for (i, (k, v)) in entries.iter().take(MAX_RENDERED_ELEMENTS).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    k.render_into(out);
                    out.push_str(" => ");
                    v.render_into(out);
                }
                if entries.len() > MAX_RENDERED_ELEMENTS {
                    out.push_str(", ...");
                }
                out.push(']');
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_rendering() {
        assert_eq!(Value::Null.render(), "null");
        assert_eq!(Value::Void.render(), "void");
        assert_eq!(Value::Bool(true).render(), "true");
        assert_eq!(Value::Int(-42).render(), "-42");
        assert_eq!(Value::Char('x').render(), "x");
        assert_eq!(Value::Str("hi".into()).render(), "hi");
    }

    #[test]
    fn test_empty_and_small_containers() {
        assert_eq!(Value::Array(vec![]).render(), "[]");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).render(),
            "[1, 2, 3]"
        );
    }

    #[test]
    fn test_large_container_is_bounded() {
        let items: Vec<Value> = (0..40).map(Value::Int).collect();
        let rendered = Value::List(items).render();
        assert!(rendered.ends_with(", ...]"), "got {rendered}");
        assert!(rendered.contains("31"));
        assert!(!rendered.contains("32,"), "element 32 must not render");
    }

    #[test]
    fn test_exactly_at_bound_has_no_marker() {
        let items: Vec<Value> = (0..MAX_RENDERED_ELEMENTS as i64).map(Value::Int).collect();
        let rendered = Value::Array(items).render();
        assert!(!rendered.contains("..."));
    }

    #[test]
    fn test_map_renders_bracketed_arrow_entries() {
        let m = Value::Map(vec![
            (Value::Str("a".into()), Value::Int(1)),
            (Value::Str("b".into()), Value::Int(2)),
        ]);
        assert_eq!(m.render(), "[a => 1, b => 2]");
    }

    #[test]
    fn test_nested_containers_recurse() {
        let v = Value::List(vec![Value::Array(vec![Value::Int(1)]), Value::Null]);
        assert_eq!(v.render(), "[[1], null]");
    }
}

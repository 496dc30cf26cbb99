//! Patterns-file content flowing into compiled pattern sets, end to end.

use metracer_pattern::PatternSet;
use metracer_protocol::{parse_patterns_file, StackTraceMode};

#[test]
fn test_file_entries_drive_matching() {
    let derived =
        parse_patterns_file("com.app.Worker::doWork\ncom.app.Manager::plan\n").unwrap();
    let set = PatternSet::compile(
        &derived.class_pattern,
        Some(&derived.method_pattern),
        StackTraceMode::Disabled,
    )
    .unwrap();

    assert!(set.is_class_matched("com.app.Worker"));
    assert!(set.is_class_matched("com.app.Manager"));
    assert!(!set.is_class_matched("org.lib.Util"));

    assert!(set.is_method_matched("com.app.Worker", "doWork"));
    assert!(!set.is_method_matched("com.app.Worker", "plan"));
    assert!(set.is_method_matched("com.app.Manager", "plan"));
}

#[test]
fn test_duplicate_entries_compile_to_single_alternative() {
    let derived = parse_patterns_file("a.B::m1\na.B::m1\n").unwrap();
    assert!(!derived.class_pattern.contains('|'));

    let set = PatternSet::compile(
        &derived.class_pattern,
        Some(&derived.method_pattern),
        StackTraceMode::Disabled,
    )
    .unwrap();
    assert!(set.is_method_matched("a.B", "m1"));
    assert!(!set.is_method_matched("a.B", "m2"));
}

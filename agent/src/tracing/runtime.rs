//! Per-thread call depth and trace line formatting.

use std::cell::Cell;

use super::sink::MessageSink;
use super::thread;
use super::value::Value;

/// Cap on indentation so a deep recursion cannot widen lines unboundedly.
const MAX_INDENT: i64 = 32;

thread_local! {
    // -1 = not inside any traced frame on this thread.
    static DEPTH: Cell<i64> = const { Cell::new(-1) };
}

/// Formats entry/exit lines and hands them to the sink.
///
/// Immutable after construction; the only mutable state is the per-thread
/// depth cell, so probes on different threads never contend.
pub struct TraceRuntime {
    sink: Option<Box<dyn MessageSink>>,
}

impl TraceRuntime {
    pub fn new(sink: Option<Box<dyn MessageSink>>) -> Self {
        Self { sink }
    }

    /// Record a method entry. Increments this thread's depth and emits
    /// `[metracer.<tid>]<indent> +++ [<depth>] <Class>.<method>(<args>)`.
    pub fn trace_entry(&self, class_name: &str, method_name: &str, args: &[(String, Value)]) {
        let depth = DEPTH.with(|d| {
            let v = d.get() + 1;
            d.set(v);
            v
        });

        let mut rendered = String::new();
        for (i, (name, value)) in args.iter().enumerate() {
            if i > 0 {
                rendered.push_str(", ");
            }
            rendered.push_str(name);
            rendered.push_str(" = ");
            rendered.push_str(&value.render());
        }

        let line = format!(
            "[metracer.{}]{} +++ [{}] {}.{}({})",
            thread::hex_id(thread::id()),
            indent(depth),
            depth,
            class_name,
            method_name,
            rendered
        );
        self.emit(class_name, method_name, &line);
    }

    /// Record a method exit and decrement this thread's depth.
    ///
    /// `Value::Void` prints `=> void`, `Value::Throwable` prints
    /// `=> exception: <repr>`, anything else prints `=> return: <repr>` —
    /// including `Value::Null` for a genuine null return.
    pub fn trace_exit(&self, payload: &Value, class_name: &str, method_name: &str) {
        let depth = DEPTH.with(|d| {
            let v = d.get();
            d.set(v - 1);
            v
        });

        let outcome = match payload {
            Value::Void => "=> void".to_string(),
            Value::Throwable(_) => format!("=> exception: {}", payload.render()),
            other => format!("=> return: {}", other.render()),
        };

        let line = format!(
            "[metracer.{}]{} --- [{}] {}.{} {}",
            thread::hex_id(thread::id()),
            indent(depth),
            depth,
            class_name,
            method_name,
            outcome
        );
        self.emit(class_name, method_name, &line);
    }

    fn emit(&self, class_name: &str, method_name: &str, line: &str) {
        if let Some(sink) = &self.sink {
            sink.print_message(class_name, method_name, line);
        }
    }
}

fn indent(depth: i64) -> String {
    " ".repeat(depth.clamp(0, MAX_INDENT) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct CollectSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl MessageSink for CollectSink {
        fn print_message(&self, _class: &str, _method: &str, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    fn runtime() -> (TraceRuntime, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let rt = TraceRuntime::new(Some(Box::new(CollectSink {
            lines: Arc::clone(&lines),
        })));
        (rt, lines)
    }

    #[test]
    fn test_entry_exit_pair_at_depth_zero() {
        let (rt, lines) = runtime();
        rt.trace_entry(
            "com.app.Worker",
            "doWork",
            &[("count".to_string(), Value::Int(3))],
        );
        rt.trace_exit(&Value::Void, "com.app.Worker", "doWork");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" +++ [0] com.app.Worker.doWork(count = 3)"));
        assert!(lines[1].contains(" --- [0] com.app.Worker.doWork => void"));
    }

    #[test]
    fn test_nested_calls_indent_and_number() {
        let (rt, lines) = runtime();
        rt.trace_entry("a.A", "outer", &[]);
        rt.trace_entry("a.A", "inner", &[]);
        rt.trace_exit(&Value::Int(1), "a.A", "inner");
        rt.trace_exit(&Value::Void, "a.A", "outer");

        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("+++ [0]"));
        assert!(lines[1].contains("  +++ [1]"), "got {}", lines[1]);
        assert!(lines[2].contains("--- [1] a.A.inner => return: 1"));
        assert!(lines[3].contains("--- [0] a.A.outer => void"));
    }

    #[test]
    fn test_null_return_is_not_void() {
        let (rt, lines) = runtime();
        rt.trace_entry("a.A", "m", &[]);
        rt.trace_exit(&Value::Null, "a.A", "m");
        assert!(lines.lock().unwrap()[1].contains("=> return: null"));
    }

    #[test]
    fn test_exception_exit_uses_display_form() {
        let (rt, lines) = runtime();
        rt.trace_entry("a.A", "m", &[]);
        rt.trace_exit(
            &Value::Throwable("java.lang.IllegalStateException: boom".to_string()),
            "a.A",
            "m",
        );
        assert!(lines.lock().unwrap()[1]
            .contains("=> exception: java.lang.IllegalStateException: boom"));
    }

    #[test]
    fn test_unknown_arg_names_render_placeholder() {
        let (rt, lines) = runtime();
        rt.trace_entry("a.A", "m", &[("<unk>".to_string(), Value::Int(7))]);
        assert!(lines.lock().unwrap()[0].contains("(<unk> = 7)"));
    }

    #[test]
    fn test_no_sink_is_silent() {
        let rt = TraceRuntime::new(None);
        rt.trace_entry("a.A", "m", &[]);
        rt.trace_exit(&Value::Void, "a.A", "m");
    }
}

//! Trace-line events streamed from the agent to the CLI.

use serde::{Deserialize, Serialize};

/// One formatted trace line produced by an injected probe.
///
/// The line already carries the thread tag, indentation and depth; class and
/// method ride along so the CLI can filter or group without re-parsing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLine {
    /// Fully-qualified class name of the traced method.
    #[serde(default)]
    pub class_name: String,
    /// Method name of the traced method.
    #[serde(default)]
    pub method_name: String,
    /// The fully formatted line, ready for the operator console.
    #[serde(default)]
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_line_serde_roundtrip() {
        let ev = TraceLine {
            class_name: "com.app.Worker".to_string(),
            method_name: "doWork".to_string(),
            line: "[metracer.0000002a] +++ [0] com.app.Worker.doWork()".to_string(),
        };
        let json = serde_json::to_string(&ev).expect("serialize");
        let decoded: TraceLine = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, ev);
    }
}

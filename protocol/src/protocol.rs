//! HTTP protocol types between CLI and agent.

use serde::{Deserialize, Serialize};

use crate::counters::Counters;

/// How the injected probes handle call-site stack traces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackTraceMode {
    /// No stack traces (the default).
    #[default]
    Disabled,
    /// Print the captured stack trace inline with the trace output.
    Print,
    /// Capture stack traces to a file next to the trace output.
    File,
}

/// An uncompiled pattern pair as entered by the operator.
///
/// Compilation (and validation) happens agent-side in `metracer-pattern`;
/// the CLI validates eagerly as well so malformed input fails before attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Regular expression selecting classes by fully-qualified name.
    pub class_pattern: String,
    /// Optional regular expression matched against `Class::method`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_pattern: Option<String>,
    #[serde(default)]
    pub stack_trace_mode: StackTraceMode,
}

/// CLI → Agent: one control-surface operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentCommand {
    /// Apply a new pattern set to the loaded classes.
    SetPatterns(PatternSpec),
    /// Restore original bytecode everywhere and clear history.
    RemovePatterns,
    /// Toggle verbose agent-side logging.
    SetVerbose(bool),
    /// Detach: remove patterns and stop the control thread.
    Shutdown,
}

/// CLI → Agent: pending command for agent polling (GET /command).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command: Option<AgentCommand>,
}

/// Agent → CLI: control thread is up and polling (POST /ready).
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyRequest {
    pub pid: u32,
}

/// Which batch a counters report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountersKind {
    /// Result of a `SetPatterns` batch.
    Instrumented,
    /// Result of a `RemovePatterns` batch; `methods_count` is methods removed.
    Removed,
}

/// Agent → CLI: batch outcome (POST /counters).
#[derive(Debug, Serialize, Deserialize)]
pub struct CountersReport {
    pub pid: u32,
    pub kind: CountersKind,
    pub counters: Counters,
}

/// Agent → CLI: agent is detaching (POST /shutdown).
#[derive(Debug, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_patterns_command_roundtrip() {
        let cmd = AgentCommand::SetPatterns(PatternSpec {
            class_pattern: r"com\.app\..*".to_string(),
            method_pattern: Some("doWork".to_string()),
            stack_trace_mode: StackTraceMode::Disabled,
        });
        let json = serde_json::to_string(&cmd).expect("serialize");
        let decoded: AgentCommand = serde_json::from_str(&json).expect("deserialize");
        match decoded {
            AgentCommand::SetPatterns(spec) => {
                assert_eq!(spec.class_pattern, r"com\.app\..*");
                assert_eq!(spec.method_pattern.as_deref(), Some("doWork"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_pattern_spec_defaults_on_old_payloads() {
        // Older CLIs omit method_pattern and stack_trace_mode entirely.
        let json = r#"{"class_pattern":"com.app"}"#;
        let spec: PatternSpec = serde_json::from_str(json).expect("deserialize");
        assert_eq!(spec.method_pattern, None);
        assert_eq!(spec.stack_trace_mode, StackTraceMode::Disabled);
    }

    #[test]
    fn test_empty_command_response() {
        let resp = CommandResponse { command: None };
        let json = serde_json::to_string(&resp).expect("serialize");
        let decoded: CommandResponse = serde_json::from_str(&json).expect("deserialize");
        assert!(decoded.command.is_none());
    }
}

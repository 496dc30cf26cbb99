//! metracer CLI - dynamic method tracing for running JVMs.

mod attach;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info};
use metracer_pattern::PatternSet;
use metracer_protocol::{
    parse_patterns_file, AgentCommand, CountersKind, PatternSpec, StackTraceMode,
};

use server::{AgentEvent, ServerHandle, TraceServer};

#[derive(Parser)]
#[command(name = "metracer")]
#[command(version, about = "Trace method calls in a running JVM without restarting it")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List running JVMs on this machine
    List,

    /// Instrument a JVM and stream method entry/exit traces
    Instrument {
        /// Target JVM pid; omit to autodiscover when exactly one JVM runs
        #[arg(env = "METRACER_PID")]
        pid: Option<u32>,

        /// Regex selecting classes by fully-qualified name
        #[arg(env = "METRACER_CLASS_PATTERN")]
        class_pattern: Option<String>,

        /// Regex matched against Class::method
        #[arg(env = "METRACER_METHOD_PATTERN")]
        method_pattern: Option<String>,

        /// Stack trace handling for instrumented methods
        #[arg(long = "stack-trace", value_enum, default_value_t = StackTraceArg::Disabled)]
        stack_trace: StackTraceArg,

        /// Truncate each trace line to this many characters
        #[arg(long = "arg-limit", value_name = "N")]
        arg_limit: Option<usize>,

        /// Read patterns (one Class::method per line) from a file instead
        /// of the positional arguments
        #[arg(long = "patterns-file", value_name = "FILE")]
        patterns_file: Option<PathBuf>,
    },

    /// Remove all metracer instrumentation from a JVM
    Deinstrument {
        /// Target JVM pid; omit to autodiscover when exactly one JVM runs
        #[arg(env = "METRACER_PID")]
        pid: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StackTraceArg {
    Disabled,
    Print,
    File,
}

impl From<StackTraceArg> for StackTraceMode {
    fn from(arg: StackTraceArg) -> Self {
        match arg {
            StackTraceArg::Disabled => StackTraceMode::Disabled,
            StackTraceArg::Print => StackTraceMode::Print,
            StackTraceArg::File => StackTraceMode::File,
        }
    }
}

/// Failure classified for the process exit code: 1 for operator mistakes,
/// 2 for everything unexpected.
enum CliFailure {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

type CliResult = Result<(), CliFailure>;

fn config_err(e: anyhow::Error) -> CliFailure {
    CliFailure::Config(e)
}

fn runtime_err(e: anyhow::Error) -> CliFailure {
    CliFailure::Runtime(e)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::List => list_jvms(),
        Commands::Instrument {
            pid,
            class_pattern,
            method_pattern,
            stack_trace,
            arg_limit,
            patterns_file,
        } => instrument(
            pid,
            class_pattern,
            method_pattern,
            stack_trace.into(),
            arg_limit,
            patterns_file,
            cli.verbose,
        ),
        Commands::Deinstrument { pid } => deinstrument(pid, cli.verbose),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliFailure::Config(e)) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
        Err(CliFailure::Runtime(e)) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn list_jvms() -> CliResult {
    let jvms = attach::discover_jvms().map_err(runtime_err)?;
    if jvms.is_empty() {
        println!("no running JVMs found");
        return Ok(());
    }
    println!("PID\tCOMMAND");
    for jvm in jvms {
        println!("{}", jvm);
    }
    Ok(())
}

/// Use the given pid, or autodiscover when exactly one JVM is visible.
fn resolve_pid(pid: Option<u32>) -> Result<u32, CliFailure> {
    if let Some(pid) = pid {
        return Ok(pid);
    }
    let jvms = attach::discover_jvms().map_err(runtime_err)?;
    match jvms.as_slice() {
        [] => Err(config_err(anyhow!("no running JVMs found; start one or pass a pid"))),
        [only] => {
            info!("auto-selected the only running JVM: pid {}", only.pid);
            Ok(only.pid)
        }
        many => Err(config_err(anyhow!(
            "several JVMs are running ({}); pass a pid",
            many.iter()
                .map(|j| j.pid.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Capture for the print/file modes is not wired into the injected probes;
/// refuse the flag up front instead of accepting a silent no-op.
fn ensure_supported_stack_trace(mode: StackTraceMode) -> Result<(), CliFailure> {
    match mode {
        StackTraceMode::Disabled => Ok(()),
        StackTraceMode::Print | StackTraceMode::File => {
            let name = if mode == StackTraceMode::Print { "print" } else { "file" };
            Err(config_err(anyhow!(
                "--stack-trace {} is not supported: stack capture is not implemented",
                name
            )))
        }
    }
}

/// Build the pattern spec from the patterns file or the positional pair,
/// validating eagerly so malformed input fails before attach.
fn resolve_patterns(
    class_pattern: Option<String>,
    method_pattern: Option<String>,
    stack_trace: StackTraceMode,
    patterns_file: Option<PathBuf>,
) -> Result<PatternSpec, CliFailure> {
    let (class_pattern, method_pattern) = if let Some(path) = patterns_file {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .map_err(config_err)?;
        let compiled = parse_patterns_file(&text)
            .with_context(|| format!("parsing {}", path.display()))
            .map_err(config_err)?;
        (compiled.class_pattern, Some(compiled.method_pattern))
    } else {
        let class = class_pattern.ok_or_else(|| {
            config_err(anyhow!("a class pattern is required (argument, env, or --patterns-file)"))
        })?;
        (class, method_pattern)
    };

    PatternSet::compile(&class_pattern, method_pattern.as_deref(), stack_trace)
        .context("invalid pattern")
        .map_err(config_err)?;

    Ok(PatternSpec {
        class_pattern,
        method_pattern,
        stack_trace_mode: stack_trace,
    })
}

struct Session {
    handle: ServerHandle,
    ready: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

/// Start the trace server and load the agent into `pid`.
fn start_session(pid: u32, verbose: bool) -> Result<(Session, mpsc::Receiver<AgentEvent>), CliFailure> {
    let (event_tx, events) = mpsc::sync_channel::<AgentEvent>(4096);
    let trace_server = TraceServer::new(event_tx).map_err(runtime_err)?;
    let handle = trace_server.handle();
    let port = trace_server.port();
    thread::spawn(move || trace_server.run());

    let agent_path = attach::agent_library_path().map_err(config_err)?;
    let mut options = format!("port={}", port);
    if verbose {
        options.push_str(",verbose=1");
    }
    debug!(
        "loading {} into pid {} with options {}",
        agent_path.display(),
        pid,
        options
    );
    attach::load_agent(pid, &agent_path, &options)
        .with_context(|| format!("attaching to pid {}", pid))
        .map_err(runtime_err)?;

    Ok((
        Session {
            handle,
            ready: Arc::new(AtomicBool::new(false)),
            disconnected: Arc::new(AtomicBool::new(false)),
        },
        events,
    ))
}

/// Consume agent events: print trace lines and counters, flip the ready and
/// disconnected flags for the interactive loop.
fn spawn_event_printer(
    session: &Session,
    events: mpsc::Receiver<AgentEvent>,
    arg_limit: Option<usize>,
) {
    let ready = Arc::clone(&session.ready);
    let disconnected = Arc::clone(&session.disconnected);
    thread::spawn(move || {
        for event in events.iter() {
            match event {
                AgentEvent::Ready { pid } => {
                    info!("agent ready in pid {}", pid);
                    ready.store(true, Ordering::Release);
                }
                AgentEvent::Trace(line) => println!("{}", clip(&line.line, arg_limit)),
                AgentEvent::Counters(report) => match report.kind {
                    CountersKind::Instrumented => println!(
                        "{} classes instrumented ({} methods), {} failed",
                        report.counters.classes_count,
                        report.counters.methods_count,
                        report.counters.failed_classes_count
                    ),
                    CountersKind::Removed => println!(
                        "instrumentation removed from {} classes ({} methods)",
                        report.counters.classes_count, report.counters.methods_count
                    ),
                },
                AgentEvent::Disconnected { pid } => {
                    debug!("agent in pid {} disconnected", pid);
                    disconnected.store(true, Ordering::Release);
                    break;
                }
            }
        }
    });
}

fn clip(line: &str, limit: Option<usize>) -> String {
    match limit {
        Some(max) if line.chars().count() > max => {
            let mut out: String = line.chars().take(max).collect();
            out.push_str("...");
            out
        }
        _ => line.to_string(),
    }
}

/// One parsed line of interactive input.
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Quit,
    Verbose(bool),
    Patterns { class: String, method: Option<String> },
}

fn parse_console_line(input: &str) -> Option<ConsoleCommand> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    match input {
        "q" | "quit" => return Some(ConsoleCommand::Quit),
        "verbose on" => return Some(ConsoleCommand::Verbose(true)),
        "verbose off" => return Some(ConsoleCommand::Verbose(false)),
        _ => {}
    }
    let mut parts = input.split_whitespace();
    let class = parts.next().unwrap_or_default().to_string();
    let method = parts.next().map(|s| s.to_string());
    Some(ConsoleCommand::Patterns { class, method })
}

fn wait_for(flag: &AtomicBool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !flag.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    true
}

fn instrument(
    pid: Option<u32>,
    class_pattern: Option<String>,
    method_pattern: Option<String>,
    stack_trace: StackTraceMode,
    arg_limit: Option<usize>,
    patterns_file: Option<PathBuf>,
    verbose: bool,
) -> CliResult {
    ensure_supported_stack_trace(stack_trace)?;
    let pid = resolve_pid(pid)?;
    let spec = resolve_patterns(class_pattern, method_pattern, stack_trace, patterns_file)?;

    let (session, events) = start_session(pid, verbose)?;
    session.handle.queue_command(AgentCommand::SetPatterns(spec));
    spawn_event_printer(&session, events, arg_limit);

    if !wait_for(&session.ready, Duration::from_secs(15)) {
        return Err(runtime_err(anyhow!("agent attached but never reported ready")));
    }

    eprintln!(
        "tracing pid {}; enter a new \"classPattern [methodPattern]\", \"verbose on|off\", or \"quit\"",
        pid
    );
    let stdin = std::io::stdin();
    loop {
        let mut input = String::new();
        match stdin.read_line(&mut input) {
            Ok(0) => break, // EOF behaves like quit
            Ok(_) => {}
            Err(e) => {
                debug!("stdin error: {}", e);
                break;
            }
        }
        match parse_console_line(&input) {
            None => continue,
            Some(ConsoleCommand::Quit) => break,
            Some(ConsoleCommand::Verbose(on)) => {
                session.handle.queue_command(AgentCommand::SetVerbose(on));
            }
            Some(ConsoleCommand::Patterns { class, method }) => {
                match PatternSet::compile(&class, method.as_deref(), stack_trace) {
                    Ok(_) => session.handle.queue_command(AgentCommand::SetPatterns(PatternSpec {
                        class_pattern: class,
                        method_pattern: method,
                        stack_trace_mode: stack_trace,
                    })),
                    Err(e) => eprintln!("invalid pattern: {}", e),
                }
            }
        }
    }

    shutdown_session(&session)
}

fn deinstrument(pid: Option<u32>, verbose: bool) -> CliResult {
    let pid = resolve_pid(pid)?;

    let (session, events) = start_session(pid, verbose)?;
    spawn_event_printer(&session, events, None);

    if !wait_for(&session.ready, Duration::from_secs(15)) {
        return Err(runtime_err(anyhow!("agent attached but never reported ready")));
    }

    // shutdown_session queues the removal; its counters print before the
    // agent confirms the detach.
    shutdown_session(&session)
}

/// Restore the target and wait for the agent to confirm it is gone.
fn shutdown_session(session: &Session) -> CliResult {
    session.handle.queue_command(AgentCommand::RemovePatterns);
    session.handle.queue_command(AgentCommand::Shutdown);

    if !wait_for(&session.disconnected, Duration::from_secs(10)) {
        session.handle.request_shutdown();
        return Err(runtime_err(anyhow!(
            "agent did not confirm shutdown; target classes may still be instrumented"
        )));
    }
    session.handle.request_shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stack_trace_is_accepted() {
        assert!(ensure_supported_stack_trace(StackTraceMode::Disabled).is_ok());
    }

    #[test]
    fn test_unimplemented_stack_trace_modes_are_config_errors() {
        for mode in [StackTraceMode::Print, StackTraceMode::File] {
            match ensure_supported_stack_trace(mode) {
                Err(CliFailure::Config(e)) => {
                    assert!(e.to_string().contains("not supported"), "got {:#}", e)
                }
                Err(CliFailure::Runtime(_)) => panic!("should exit with code 1, not 2"),
                Ok(()) => panic!("mode {:?} must be rejected", mode),
            }
        }
    }

    #[test]
    fn test_console_quit_and_blank_lines() {
        assert_eq!(parse_console_line("quit\n"), Some(ConsoleCommand::Quit));
        assert_eq!(parse_console_line("q"), Some(ConsoleCommand::Quit));
        assert_eq!(parse_console_line("   \n"), None);
    }

    #[test]
    fn test_console_verbose_toggle() {
        assert_eq!(
            parse_console_line("verbose on\n"),
            Some(ConsoleCommand::Verbose(true))
        );
        assert_eq!(
            parse_console_line("verbose off"),
            Some(ConsoleCommand::Verbose(false))
        );
    }

    #[test]
    fn test_console_pattern_pair() {
        assert_eq!(
            parse_console_line("com\\.app\\..* doWork\n"),
            Some(ConsoleCommand::Patterns {
                class: "com\\.app\\..*".to_string(),
                method: Some("doWork".to_string()),
            })
        );
        assert_eq!(
            parse_console_line("com\\.app\\..*"),
            Some(ConsoleCommand::Patterns {
                class: "com\\.app\\..*".to_string(),
                method: None,
            })
        );
    }
}

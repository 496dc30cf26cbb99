//! metracer agent - loaded into the target JVM for dynamic method tracing.
//!
//! This library is compiled as a cdylib and loaded either at startup via
//! `-agentpath:` or into a running JVM via the HotSpot dynamic attach
//! mechanism. It rewrites the bytecode of pattern-matched classes so their
//! methods report entry and exit to the CLI over localhost HTTP.

pub mod http_client;
pub mod jvm;
pub mod session;
pub mod tracing;
pub mod transform;

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use metracer_pattern::PatternSet;
use metracer_protocol::{AgentCommand, CountersKind, TraceLine};

use crate::http_client::HttpClient;
use crate::jvm::env::{attach_current_thread, JvmtiEnv};
use crate::jvm::host::JvmClassHost;
use crate::jvm::probe::install_probe;
use crate::jvm::sys::jni::{jint, JavaVM, JNI_OK};
use crate::session::SessionController;
use crate::tracing::{ChannelSink, TraceRuntime};

// Flag to signal the agent's command thread to shut down. Set by the
// Shutdown command and by the atexit handler when the JVM is exiting.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
// Ensures /shutdown is only sent once (prevents double-send from both
// atexit handler and command thread).
static SHUTDOWN_SENT: AtomicBool = AtomicBool::new(false);
// Set by the flush thread after it has drained all pending trace lines on
// shutdown. The shutdown paths wait on this so lines are flushed before the
// CLI stops listening.
static FLUSH_COMPLETE: AtomicBool = AtomicBool::new(false);

/// Global agent state. Replaced wholesale on re-attach: each `metracer`
/// invocation loads the library again with a fresh server port, so the slot
/// must be swappable, not write-once.
static AGENT: RwLock<Option<Arc<Agent>>> = RwLock::new(None);

/// Bumped on every attach. A command thread from a superseded session sees
/// the mismatch and exits without touching the new session's classes.
static SESSION_GENERATION: AtomicU64 = AtomicU64::new(0);

/// One-time VM setup (capabilities, load hook, probe class) survives
/// re-attach; the JVM keeps the library loaded.
static VM_INSTALLED: AtomicBool = AtomicBool::new(false);

/// The agent managing the trace runtime and CLI communication.
pub struct Agent {
    /// HTTP client for control-plane calls from the command thread.
    http: HttpClient,
    runtime: TraceRuntime,
}

impl Agent {
    /// Create a new agent connected to the CLI via HTTP.
    pub fn new(url: &str) -> Self {
        let http = HttpClient::new(url);

        // Trace batching: probe natives push to this channel, a dedicated
        // flush thread drains and sends in batches.
        let (event_tx, event_rx) = mpsc::sync_channel::<TraceLine>(4096);

        // Spawn flush thread with its own HTTP client
        let flush_http = HttpClient::new(url);
        std::thread::spawn(move || {
            event_flush_loop(flush_http, event_rx);
        });

        let runtime = TraceRuntime::new(Some(Box::new(ChannelSink::new(event_tx))));

        Self { http, runtime }
    }

    /// Get a handle to the current session's agent.
    pub fn get() -> Option<Arc<Agent>> {
        AGENT.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn runtime(&self) -> &TraceRuntime {
        &self.runtime
    }

    /// Run the agent's command loop.
    ///
    /// Polls the CLI for commands and drives the instrumentation session.
    /// Returns when a shutdown is requested, the CLI becomes unreachable,
    /// or a newer attach supersedes this session.
    pub fn run(&self, mut session: SessionController<JvmClassHost>, generation: u64) -> Result<()> {
        info!("agent started, polling for commands");
        let pid = std::process::id();

        let mut consecutive_errors: u32 = 0;
        const MAX_CONSECUTIVE_ERRORS: u32 = 5;

        loop {
            if SESSION_GENERATION.load(Ordering::Acquire) != generation {
                // A newer attach owns the classes now; leave them alone.
                info!("session superseded by a newer attach, stopping");
                break;
            }
            if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
                session.remove_patterns();
                self.send_shutdown_once(pid);
                break;
            }

            match self.http.poll_command() {
                Ok(Some(command)) => {
                    consecutive_errors = 0;
                    if self.handle_command(command, &mut session, pid) {
                        self.send_shutdown_once(pid);
                        break;
                    }
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    // Server unreachable — if we're shutting down, that's expected
                    if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
                        info!("server unreachable during shutdown (expected)");
                        session.remove_patterns();
                        break;
                    }
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        info!(
                            "server unreachable after {} attempts, restoring classes and stopping",
                            consecutive_errors
                        );
                        session.remove_patterns();
                        break;
                    }
                    debug!("command poll error (attempt {}): {}", consecutive_errors, e);
                }
            }

            std::thread::sleep(Duration::from_millis(200));
        }

        info!("agent command loop stopped");
        Ok(())
    }

    /// Execute one command. Returns true when the loop should stop.
    fn handle_command(
        &self,
        command: AgentCommand,
        session: &mut SessionController<JvmClassHost>,
        pid: u32,
    ) -> bool {
        match command {
            AgentCommand::SetPatterns(spec) => {
                match PatternSet::compile(
                    &spec.class_pattern,
                    spec.method_pattern.as_deref(),
                    spec.stack_trace_mode,
                ) {
                    Ok(set) => {
                        let counters = session.apply_patterns(set);
                        if let Err(e) =
                            self.http.send_counters(pid, CountersKind::Instrumented, counters)
                        {
                            warn!("reporting instrumentation counters failed: {}", e);
                        }
                    }
                    // The CLI validates patterns before sending; reaching this
                    // means version skew, so report an empty batch.
                    Err(e) => {
                        warn!("rejected pattern set: {}", e);
                        let _ = self.http.send_counters(
                            pid,
                            CountersKind::Instrumented,
                            Default::default(),
                        );
                    }
                }
                false
            }
            AgentCommand::RemovePatterns => {
                let counters = session.remove_patterns();
                if let Err(e) = self.http.send_counters(pid, CountersKind::Removed, counters) {
                    warn!("reporting removal counters failed: {}", e);
                }
                false
            }
            AgentCommand::SetVerbose(verbose) => {
                let level = if verbose {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                };
                log::set_max_level(level);
                false
            }
            AgentCommand::Shutdown => {
                info!("shutdown command received, restoring classes");
                session.remove_patterns();
                SHUTDOWN_REQUESTED.store(true, Ordering::Release);
                true
            }
        }
    }

    fn send_shutdown_once(&self, pid: u32) {
        // Wait for the flush thread to drain pending lines before telling
        // the CLI we are gone, otherwise it may exit before displaying them.
        let deadline = std::time::Instant::now() + Duration::from_millis(300);
        while !FLUSH_COMPLETE.load(Ordering::Acquire) {
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if !SHUTDOWN_SENT.swap(true, Ordering::SeqCst) {
            let _ = self.http.shutdown(pid);
        }
    }
}

/// Flush loop for batched trace delivery.
///
/// Collects lines from the channel and sends them in batches of up to 64.
/// Uses `recv_timeout` to coalesce lines that arrive close together,
/// flushing either when the batch is full or after a 50ms idle period.
fn event_flush_loop(http: HttpClient, rx: mpsc::Receiver<TraceLine>) {
    let mut batch = Vec::with_capacity(64);
    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => {
                batch.push(event);
                // Drain up to 64 without blocking
                while batch.len() < 64 {
                    match rx.try_recv() {
                        Ok(e) => batch.push(e),
                        Err(_) => break,
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
                    // Drain remaining lines before exiting
                    while let Ok(e) = rx.try_recv() {
                        batch.push(e);
                    }
                    if !batch.is_empty() {
                        let _ = http.send_events(&batch);
                    }
                    FLUSH_COMPLETE.store(true, Ordering::Release);
                    return;
                }
                continue;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                while let Ok(e) = rx.try_recv() {
                    batch.push(e);
                }
                if !batch.is_empty() {
                    let _ = http.send_events(&batch);
                }
                FLUSH_COMPLETE.store(true, Ordering::Release);
                return;
            }
        }

        if !batch.is_empty() {
            let _ = http.send_events(&batch);
            batch.clear();
        }

        // Check for shutdown after each batch send, not just on timeout.
        // Without this, the flush thread can't exit promptly when lines
        // keep arriving (the Timeout arm is never reached).
        if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
            while let Ok(e) = rx.try_recv() {
                batch.push(e);
            }
            if !batch.is_empty() {
                let _ = http.send_events(&batch);
            }
            FLUSH_COMPLETE.store(true, Ordering::Release);
            return;
        }
    }
}

/// Options passed by the CLI through the attach mechanism, e.g.
/// `port=43571,verbose=1`.
#[derive(Debug, PartialEq, Eq)]
struct AgentOptions {
    port: u16,
    verbose: bool,
}

impl AgentOptions {
    fn parse(options: &str) -> Result<Self> {
        let mut port = None;
        let mut verbose = false;
        for item in options.split(',').filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some(("port", value)) => {
                    port = Some(value.parse().context("port is not a number")?);
                }
                Some(("verbose", value)) => verbose = value == "1" || value == "true",
                _ => bail!("unrecognized agent option: {}", item),
            }
        }
        let Some(port) = port else {
            bail!("missing required agent option: port");
        };
        Ok(Self { port, verbose })
    }

    fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

// Raw JavaVM pointer handed to the command thread. The VM outlives every
// agent thread and the pointer is only used to attach and fetch
// per-thread environments.
struct VmHandle(*mut JavaVM);
unsafe impl Send for VmHandle {}

fn initialize(vm: *mut JavaVM, options: *const c_char) -> Result<()> {
    let _ = env_logger::try_init();

    let options = if options.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(options) }
            .to_string_lossy()
            .into_owned()
    };
    let options = AgentOptions::parse(&options)?;
    if options.verbose {
        log::set_max_level(log::LevelFilter::Debug);
    }

    let jvmti = JvmtiEnv::from_vm(vm)?;
    if !VM_INSTALLED.load(Ordering::Acquire) {
        jvmti.add_retransform_capabilities()?;
        jvmti.enable_class_file_load_hook(jvm::host::class_file_load_hook)?;

        // Agent_OnLoad/Agent_OnAttach both run on an attached thread, so a
        // JNI environment is available for defining the probe class here.
        let jni = attach_current_thread(vm)?;
        install_probe(&jni)?;
        VM_INSTALLED.store(true, Ordering::Release);
    }

    // Retire any previous session before publishing the new agent.
    let generation = SESSION_GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
    SHUTDOWN_REQUESTED.store(false, Ordering::Release);
    SHUTDOWN_SENT.store(false, Ordering::Release);
    FLUSH_COMPLETE.store(false, Ordering::Release);

    let url = options.url();
    let agent = Arc::new(Agent::new(&url));
    *AGENT.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&agent));

    let pid = std::process::id();
    agent.http.ready(pid)?;
    info!("connected to CLI at {}, probe installed", url);

    // Last-resort flush when the JVM exits without a Shutdown command.
    extern "C" fn shutdown_handler() {
        SHUTDOWN_REQUESTED.store(true, Ordering::Release);
        let deadline = std::time::Instant::now() + Duration::from_millis(300);
        while !FLUSH_COMPLETE.load(Ordering::Acquire) {
            if std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if !SHUTDOWN_SENT.swap(true, Ordering::SeqCst) {
            if let Some(agent) = Agent::get() {
                let _ = agent.http.shutdown(std::process::id());
            }
        }
    }
    #[cfg(unix)]
    unsafe {
        libc::atexit(shutdown_handler);
    }

    // Command thread: attach to the VM so JVMTI local references created
    // while enumerating and retransforming classes are valid.
    let handle = VmHandle(vm);
    std::thread::spawn(move || {
        let handle = handle;
        if let Err(e) = attach_current_thread(handle.0) {
            error!("attaching command thread failed: {}", e);
            return;
        }
        let session = SessionController::new(JvmClassHost::new(jvmti));
        if let Err(e) = agent.run(session, generation) {
            error!("agent error: {}", e);
        }
    });

    Ok(())
}

/// JVMTI entry point for `-agentpath:` at JVM startup.
///
/// # Safety
/// Called by the JVM with a valid `JavaVM` pointer.
#[no_mangle]
pub unsafe extern "system" fn Agent_OnLoad(
    vm: *mut JavaVM,
    options: *const c_char,
    _reserved: *mut c_void,
) -> jint {
    match initialize(vm, options) {
        Ok(()) => JNI_OK,
        Err(e) => {
            error!("agent initialization failed: {:#}", e);
            -1
        }
    }
}

/// JVMTI entry point for dynamic attach to a running JVM.
///
/// # Safety
/// Called by the JVM with a valid `JavaVM` pointer.
#[no_mangle]
pub unsafe extern "system" fn Agent_OnAttach(
    vm: *mut JavaVM,
    options: *const c_char,
    _reserved: *mut c_void,
) -> jint {
    Agent_OnLoad(vm, options, _reserved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_require_port() {
        assert!(AgentOptions::parse("").is_err());
        assert!(AgentOptions::parse("verbose=1").is_err());
    }

    #[test]
    fn test_options_parse_port_and_verbose() {
        let opts = AgentOptions::parse("port=43571,verbose=1").unwrap();
        assert_eq!(
            opts,
            AgentOptions {
                port: 43571,
                verbose: true
            }
        );
        assert_eq!(opts.url(), "http://127.0.0.1:43571");
    }

    #[test]
    fn test_options_reject_unknown_keys() {
        assert!(AgentOptions::parse("port=1,frobnicate=yes").is_err());
        assert!(AgentOptions::parse("port=notaport").is_err());
    }
}

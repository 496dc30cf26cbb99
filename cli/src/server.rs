//! HTTP server for agent communication.
//!
//! Receives agent requests via an HTTP server using `tiny_http`. Each agent
//! endpoint maps to a specific URL path; the agent polls `GET /command` for
//! queued control operations and pushes traces and counters back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;
use tiny_http::{Response, Server};

use metracer_protocol::{
    AgentCommand, CommandResponse, CountersReport, ReadyRequest, ShutdownRequest, TraceLine,
};

/// Events sent from the HTTP server to the main loop.
pub enum AgentEvent {
    /// Agent attached and its command thread is polling.
    Ready { pid: u32 },
    /// One trace line from the target.
    Trace(TraceLine),
    /// Outcome of an instrument/remove batch.
    Counters(CountersReport),
    /// Agent is detaching.
    Disconnected { pid: u32 },
}

/// Shared state for the HTTP server thread.
struct SharedState {
    /// Commands waiting for the agent's next poll, oldest first.
    commands: Mutex<VecDeque<AgentCommand>>,
    event_tx: SyncSender<AgentEvent>,
    shutdown_command: AtomicBool,
}

/// Handle for the main thread: queue commands while the server thread owns
/// the listener.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<SharedState>,
}

impl ServerHandle {
    pub fn queue_command(&self, command: AgentCommand) {
        self.shared
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(command);
    }

    /// Stop accepting requests after the in-flight one completes.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_command.store(true, Ordering::SeqCst);
    }
}

/// HTTP server for agent communication.
pub struct TraceServer {
    server: Server,
    port: u16,
    shared: Arc<SharedState>,
}

/// Create a TcpListener bound to 127.0.0.1:0 with SO_REUSEADDR set before
/// bind, so TIME_WAIT sockets from earlier sessions cannot collide.
#[cfg(unix)]
fn create_reuse_addr_listener() -> Result<std::net::TcpListener> {
    use std::os::unix::io::FromRawFd;

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            anyhow::bail!("socket() failed: {}", std::io::Error::last_os_error());
        }

        let optval: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes([127, 0, 0, 1]),
            },
            sin_zero: [0; 8],
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            sin_len: std::mem::size_of::<libc::sockaddr_in>() as u8,
        };

        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            anyhow::bail!("bind() failed: {}", err);
        }

        if libc::listen(fd, 128) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            anyhow::bail!("listen() failed: {}", err);
        }

        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn create_reuse_addr_listener() -> Result<std::net::TcpListener> {
    Ok(std::net::TcpListener::bind("127.0.0.1:0")?)
}

impl TraceServer {
    /// Create a new trace server bound to a random port.
    pub fn new(event_tx: SyncSender<AgentEvent>) -> Result<Self> {
        let listener = create_reuse_addr_listener()?;

        let server = Server::from_listener(listener, None)
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP server: {}", e))?;

        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| anyhow::anyhow!("Failed to get server port"))?;

        let shared = Arc::new(SharedState {
            commands: Mutex::new(VecDeque::new()),
            event_tx,
            shutdown_command: AtomicBool::new(false),
        });

        Ok(Self {
            server,
            port,
            shared,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the HTTP server, processing requests until shutdown.
    ///
    /// Requests are handled inline on the listener thread; nothing the
    /// agent sends needs to block.
    pub fn run(self) {
        for request in self.server.incoming_requests() {
            if self.shared.shutdown_command.load(Ordering::SeqCst) {
                let _ =
                    request.respond(Response::from_string("shutting down").with_status_code(503));
                break;
            }

            handle_request(request, &self.shared);

            // Check after handling — /shutdown sets the flag, and we need
            // to exit before blocking on the next accept().
            if self.shared.shutdown_command.load(Ordering::SeqCst) {
                break;
            }
        }
    }
}

fn handle_request(request: tiny_http::Request, shared: &SharedState) {
    let url = request.url().to_string();
    let method = request.method().to_string();

    match (method.as_str(), url.as_str()) {
        ("GET", "/command") => handle_command(request, shared),
        ("POST", "/ready") => handle_ready(request, shared),
        ("POST", "/counters") => handle_counters(request, shared),
        ("POST", "/events") => handle_events(request, shared),
        ("POST", "/shutdown") => handle_shutdown(request, shared),
        _ => {
            let _ = request.respond(Response::from_string("Not Found").with_status_code(404));
        }
    }
}

fn read_json<T: for<'de> serde::Deserialize<'de>>(request: &mut tiny_http::Request) -> Result<T> {
    let mut body = String::new();
    request.as_reader().read_to_string(&mut body)?;
    Ok(serde_json::from_str(&body)?)
}

fn respond_json<T: serde::Serialize>(request: tiny_http::Request, data: &T) {
    match serde_json::to_string(data) {
        Ok(json) => {
            let response = Response::from_string(json).with_header(
                "Content-Type: application/json"
                    .parse::<tiny_http::Header>()
                    .unwrap(),
            );
            let _ = request.respond(response);
        }
        Err(e) => {
            log::error!("Failed to serialize response: {}", e);
            let _ = request
                .respond(Response::from_string("Internal Server Error").with_status_code(500));
        }
    }
}

fn respond_ok(request: tiny_http::Request) {
    let _ = request.respond(Response::from_string("OK"));
}

fn respond_error(request: tiny_http::Request, msg: &str) {
    let _ = request.respond(Response::from_string(msg).with_status_code(400));
}

fn handle_command(request: tiny_http::Request, shared: &SharedState) {
    let command = shared
        .commands
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front();
    if let Some(cmd) = &command {
        debug!("dispatching command to agent: {:?}", cmd);
    }
    respond_json(request, &CommandResponse { command });
}

fn handle_ready(mut request: tiny_http::Request, shared: &SharedState) {
    let req: ReadyRequest = match read_json(&mut request) {
        Ok(r) => r,
        Err(e) => {
            respond_error(request, &format!("Invalid request: {}", e));
            return;
        }
    };

    debug!("agent in pid {} is ready", req.pid);
    let _ = shared.event_tx.send(AgentEvent::Ready { pid: req.pid });
    respond_ok(request);
}

fn handle_counters(mut request: tiny_http::Request, shared: &SharedState) {
    let report: CountersReport = match read_json(&mut request) {
        Ok(r) => r,
        Err(e) => {
            respond_error(request, &format!("Invalid counters: {}", e));
            return;
        }
    };

    let _ = shared.event_tx.send(AgentEvent::Counters(report));
    respond_ok(request);
}

fn handle_events(mut request: tiny_http::Request, shared: &SharedState) {
    let lines: Vec<TraceLine> = match read_json(&mut request) {
        Ok(e) => e,
        Err(e) => {
            respond_error(request, &format!("Invalid events: {}", e));
            return;
        }
    };

    for line in lines {
        let _ = shared.event_tx.send(AgentEvent::Trace(line));
    }
    respond_ok(request);
}

fn handle_shutdown(mut request: tiny_http::Request, shared: &SharedState) {
    let req: ShutdownRequest = match read_json(&mut request) {
        Ok(r) => r,
        Err(e) => {
            respond_error(request, &format!("Invalid request: {}", e));
            return;
        }
    };

    debug!("agent in pid {} is detaching", req.pid);
    let _ = shared.event_tx.send(AgentEvent::Disconnected { pid: req.pid });
    shared.shutdown_command.store(true, Ordering::SeqCst);
    respond_ok(request);
}

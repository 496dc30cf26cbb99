//! HTTP client for agent-to-CLI communication.
//!
//! Uses raw `TcpStream` for localhost HTTP to minimize dependencies.
//! Each operation is a single independent HTTP request — no shared stream
//! beyond a one-slot keep-alive pool, no reconnection ceremony.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use log::debug;

use metracer_protocol::{
    AgentCommand, CommandResponse, Counters, CountersKind, CountersReport, ReadyRequest,
    ShutdownRequest, TraceLine,
};

/// HTTP client for communicating with the CLI server.
///
/// Uses raw `TcpStream` with HTTP/1.1 keep-alive for connection pooling.
/// Endpoint paths are precomputed to avoid per-request formatting.
/// Falls back to reconnection on any I/O error.
pub struct HttpClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    path_ready: String,
    path_command: String,
    path_counters: String,
    path_events: String,
    path_shutdown: String,
}

/// Maximum number of retries for the initial /ready handshake, where the CLI
/// server may not be listening yet.
const INIT_MAX_RETRIES: u32 = 5;

/// Read a complete HTTP response from a stream.
/// Returns (status_code, body).
fn read_http_response(stream: &mut TcpStream) -> Result<(u16, String)> {
    // Read headers byte-by-byte until we find \r\n\r\n
    let mut header_buf = Vec::with_capacity(512);
    let mut prev = [0u8; 4];
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        header_buf.push(byte[0]);
        prev[0] = prev[1];
        prev[1] = prev[2];
        prev[2] = prev[3];
        prev[3] = byte[0];
        if prev == [b'\r', b'\n', b'\r', b'\n'] {
            break;
        }
        if header_buf.len() > 8192 {
            anyhow::bail!("HTTP response headers too large");
        }
    }

    let header_str = String::from_utf8_lossy(&header_buf);

    // Parse status code from first line
    let status_line = header_str.lines().next().unwrap_or("");
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    // Find Content-Length
    let content_length: usize = header_str
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(0);

    // Check for chunked transfer encoding
    let is_chunked = header_str.lines().any(|line| {
        line.to_ascii_lowercase().starts_with("transfer-encoding:")
            && line.to_ascii_lowercase().contains("chunked")
    });

    // Read body
    let body = if is_chunked {
        read_chunked_body(stream)?
    } else if content_length > 0 {
        let mut body_buf = vec![0u8; content_length];
        stream.read_exact(&mut body_buf)?;
        String::from_utf8_lossy(&body_buf).to_string()
    } else {
        String::new()
    };

    Ok((status_code, body))
}

/// Read a chunked transfer-encoding body.
fn read_chunked_body(stream: &mut TcpStream) -> Result<String> {
    let mut body = Vec::new();
    loop {
        // Read chunk size line
        let mut size_line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte)?;
            if byte[0] == b'\n' && size_line.last() == Some(&b'\r') {
                size_line.pop(); // remove \r
                break;
            }
            size_line.push(byte[0]);
        }
        let size_str = String::from_utf8_lossy(&size_line);
        let chunk_size = usize::from_str_radix(size_str.trim(), 16).unwrap_or(0);
        if chunk_size == 0 {
            // Read trailing \r\n
            let mut trailer = [0u8; 2];
            let _ = stream.read_exact(&mut trailer);
            break;
        }
        let mut chunk = vec![0u8; chunk_size];
        stream.read_exact(&mut chunk)?;
        body.extend_from_slice(&chunk);
        // Read trailing \r\n after chunk data
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf)?;
    }
    Ok(String::from_utf8_lossy(&body).to_string())
}

impl HttpClient {
    /// Create a new HTTP client pointing at the CLI server.
    pub fn new(url: &str) -> Self {
        // Extract host:port from URL like "http://127.0.0.1:12345"
        let addr = url.strip_prefix("http://").unwrap_or(url).to_string();

        HttpClient {
            addr,
            conn: Mutex::new(None),
            path_ready: "/ready".to_string(),
            path_command: "/command".to_string(),
            path_counters: "/counters".to_string(),
            path_events: "/events".to_string(),
            path_shutdown: "/shutdown".to_string(),
        }
    }

    /// Get or create a TCP connection with keep-alive.
    fn get_conn(&self, timeout: Duration) -> Result<TcpStream> {
        // Try to reuse existing connection
        if let Some(stream) = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stream.set_read_timeout(Some(timeout));
            let _ = stream.set_write_timeout(Some(timeout));
            return Ok(stream);
        }

        // Create new connection
        let stream = TcpStream::connect_timeout(&self.addr.parse()?, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Return a connection to the pool for reuse.
    fn return_conn(&self, stream: TcpStream) {
        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
    }

    /// Send an HTTP POST request and return the response body.
    fn post(&self, path: &str, body: &str, timeout: Duration) -> Result<String> {
        // Try with existing connection first, then retry with new connection
        for attempt in 0..2 {
            let mut stream = match self.get_conn(timeout) {
                Ok(s) => s,
                Err(e) if attempt == 0 => {
                    // Connection pool had a stale connection, retry
                    debug!("Stale connection, reconnecting: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let request = format!(
                "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                path, self.addr, body.len(), body
            );

            if let Err(e) = stream.write_all(request.as_bytes()) {
                if attempt == 0 {
                    debug!("Write failed, reconnecting: {}", e);
                    continue;
                }
                return Err(e.into());
            }

            match read_http_response(&mut stream) {
                Ok((status, resp_body)) => {
                    if (200..300).contains(&status) {
                        self.return_conn(stream);
                        return Ok(resp_body);
                    }
                    self.return_conn(stream);
                    anyhow::bail!("HTTP {} from POST {}: {}", status, path, resp_body);
                }
                Err(e) if attempt == 0 => {
                    debug!("Read failed, reconnecting: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        anyhow::bail!("Failed to POST {} after retries", path)
    }

    /// Send an HTTP GET request and return the response body.
    fn get(&self, path: &str, timeout: Duration) -> Result<String> {
        for attempt in 0..2 {
            let mut stream = match self.get_conn(timeout) {
                Ok(s) => s,
                Err(e) if attempt == 0 => {
                    debug!("Stale connection, reconnecting: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, self.addr);

            if let Err(e) = stream.write_all(request.as_bytes()) {
                if attempt == 0 {
                    debug!("Write failed, reconnecting: {}", e);
                    continue;
                }
                return Err(e.into());
            }

            match read_http_response(&mut stream) {
                Ok((status, resp_body)) => {
                    if (200..300).contains(&status) {
                        self.return_conn(stream);
                        return Ok(resp_body);
                    }
                    self.return_conn(stream);
                    anyhow::bail!("HTTP {} from GET {}: {}", status, path, resp_body);
                }
                Err(e) if attempt == 0 => {
                    debug!("Read failed, reconnecting: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        anyhow::bail!("Failed to GET {} after retries", path)
    }

    /// POST with retry and exponential backoff, for the /ready handshake
    /// racing the CLI server start.
    fn post_with_retry(&self, path: &str, body: &str, max_retries: u32) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                // Backoff: 50ms, 100ms, 200ms, 400ms, 800ms (capped)
                std::thread::sleep(Duration::from_millis(50 * (1 << attempt.min(4))));
            }
            match self.post(path, body, Duration::from_secs(10)) {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    debug!(
                        "POST {} attempt {}/{} failed: {}",
                        path,
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }

    /// Notify CLI that the control thread is up and polling (POST /ready).
    pub fn ready(&self, pid: u32) -> Result<()> {
        let req = ReadyRequest { pid };
        let json = serde_json::to_string(&req)?;
        self.post_with_retry(&self.path_ready, &json, INIT_MAX_RETRIES)?;
        Ok(())
    }

    /// Poll for a pending command (GET /command).
    pub fn poll_command(&self) -> Result<Option<AgentCommand>> {
        let body = self.get(&self.path_command, Duration::from_secs(2))?;
        let resp: CommandResponse = serde_json::from_str(&body)?;
        Ok(resp.command)
    }

    /// Report the outcome of an instrument/remove batch (POST /counters).
    pub fn send_counters(&self, pid: u32, kind: CountersKind, counters: Counters) -> Result<()> {
        let req = CountersReport { pid, kind, counters };
        let json = serde_json::to_string(&req)?;
        self.post(&self.path_counters, &json, Duration::from_secs(5))?;
        Ok(())
    }

    /// Send a batch of trace lines (POST /events).
    pub fn send_events(&self, events: &[TraceLine]) -> Result<()> {
        let json = serde_json::to_string(events)?;
        self.post(&self.path_events, &json, Duration::from_secs(5))?;
        Ok(())
    }

    /// Notify CLI of agent shutdown (POST /shutdown).
    pub fn shutdown(&self, pid: u32) -> Result<()> {
        let req = ShutdownRequest { pid };
        let json = serde_json::to_string(&req)?;
        self.post(&self.path_shutdown, &json, Duration::from_secs(2))?;
        Ok(())
    }
}

//! JVM discovery and the HotSpot dynamic-attach handshake.
//!
//! Discovery walks the per-user `hsperfdata` directories HotSpot maintains
//! under `/tmp` and decorates each pid with its command line from `/proc`.
//! Attach is the classic handshake: drop an `.attach_pid<pid>` marker, poke
//! the JVM with SIGQUIT, then speak the line protocol over the
//! `/tmp/.java_pid<pid>` unix socket.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::debug;

/// A JVM visible on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JvmInfo {
    pub pid: u32,
    /// Command line with NULs replaced by spaces; empty when unreadable
    /// (other user's process).
    pub command: String,
}

impl fmt::Display for JvmInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.command.is_empty() {
            write!(f, "{}\t<unknown>", self.pid)
        } else {
            write!(f, "{}\t{}", self.pid, self.command)
        }
    }
}

/// Enumerate running JVMs from `/tmp/hsperfdata_<user>/<pid>` entries.
/// Stale entries (no such process) are skipped.
pub fn discover_jvms() -> Result<Vec<JvmInfo>> {
    let mut jvms = Vec::new();
    let tmp = Path::new("/tmp");
    for entry in std::fs::read_dir(tmp).context("reading /tmp")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("hsperfdata_") || !entry.path().is_dir() {
            continue;
        }
        for pid_entry in std::fs::read_dir(entry.path()).into_iter().flatten().flatten() {
            let Some(pid) = pid_entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if !process_alive(pid) {
                debug!("skipping stale hsperfdata entry for pid {}", pid);
                continue;
            }
            jvms.push(JvmInfo {
                pid,
                command: read_cmdline(pid),
            });
        }
    }
    jvms.sort_by_key(|j| j.pid);
    jvms.dedup_by_key(|j| j.pid);
    Ok(jvms)
}

fn read_cmdline(pid: u32) -> String {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).unwrap_or_default();
    cmdline_to_string(&raw)
}

fn cmdline_to_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without delivering a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Load the agent library into a running JVM and pass it `options`.
#[cfg(unix)]
pub fn load_agent(pid: u32, agent_path: &Path, options: &str) -> Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let socket_path = PathBuf::from(format!("/tmp/.java_pid{}", pid));
    let marker_path = PathBuf::from(format!("/tmp/.attach_pid{}", pid));

    // The attach listener starts lazily: the marker file plus SIGQUIT tells
    // the JVM to bring it up.
    if !socket_path.exists() {
        std::fs::File::create(&marker_path)
            .with_context(|| format!("creating {}", marker_path.display()))?;
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGQUIT) } != 0 {
            let _ = std::fs::remove_file(&marker_path);
            bail!("signalling pid {}: {}", pid, std::io::Error::last_os_error());
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket_path.exists() {
            if Instant::now() >= deadline {
                let _ = std::fs::remove_file(&marker_path);
                bail!(
                    "pid {} did not open its attach socket within 5s (not a HotSpot JVM?)",
                    pid
                );
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = std::fs::remove_file(&marker_path);

    let mut stream = UnixStream::connect(&socket_path)
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    // Protocol: version, command, then exactly three NUL-terminated
    // arguments. "true" marks the library path as absolute.
    let agent_path = agent_path
        .to_str()
        .context("agent library path is not valid UTF-8")?;
    let mut request = Vec::new();
    for part in ["1", "load", agent_path, "true", options] {
        request.extend_from_slice(part.as_bytes());
        request.push(0);
    }
    stream.write_all(&request).context("writing attach request")?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .context("reading attach response")?;
    parse_attach_response(&response)
}

#[cfg(not(unix))]
pub fn load_agent(_pid: u32, _agent_path: &Path, _options: &str) -> Result<()> {
    bail!("dynamic attach is only supported on unix");
}

/// The response is one status line for the attach operation, then for
/// `load` a second line with the agent's own return code.
fn parse_attach_response(response: &str) -> Result<()> {
    let mut lines = response.lines();
    let status: i32 = lines
        .next()
        .unwrap_or("")
        .trim()
        .parse()
        .with_context(|| format!("unparseable attach response: {:?}", response))?;
    if status != 0 {
        bail!("attach listener rejected the load (status {})", status);
    }
    if let Some(agent_rc) = lines.next().and_then(|l| l.trim().parse::<i32>().ok()) {
        if agent_rc != 0 {
            bail!("agent initialization failed (return code {})", agent_rc);
        }
    }
    Ok(())
}

/// Locate the agent cdylib: `METRACER_AGENT_PATH` wins, otherwise it is
/// expected next to the `metracer` executable.
pub fn agent_library_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("METRACER_AGENT_PATH") {
        let path = PathBuf::from(path);
        if !path.exists() {
            bail!("METRACER_AGENT_PATH points at {}, which does not exist", path.display());
        }
        return Ok(path);
    }

    let exe = std::env::current_exe().context("locating metracer executable")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    let name = if cfg!(target_os = "macos") {
        "libmetracer_agent.dylib"
    } else {
        "libmetracer_agent.so"
    };
    let candidate = dir.join(name);
    if !candidate.exists() {
        bail!(
            "agent library not found at {} (set METRACER_AGENT_PATH)",
            candidate.display()
        );
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_joins_nul_separated_argv() {
        let raw = b"java\0-Xmx512m\0-jar\0app.jar\0";
        assert_eq!(cmdline_to_string(raw), "java -Xmx512m -jar app.jar");
        assert_eq!(cmdline_to_string(b""), "");
    }

    #[test]
    fn test_attach_response_success() {
        assert!(parse_attach_response("0\n").is_ok());
        assert!(parse_attach_response("0\n0\n").is_ok());
    }

    #[test]
    fn test_attach_response_listener_error() {
        let err = parse_attach_response("101\n").unwrap_err();
        assert!(err.to_string().contains("status 101"));
    }

    #[test]
    fn test_attach_response_agent_error() {
        let err = parse_attach_response("0\n-1\n").unwrap_err();
        assert!(err.to_string().contains("return code -1"));
    }

    #[test]
    fn test_attach_response_garbage() {
        assert!(parse_attach_response("").is_err());
        assert!(parse_attach_response("boom").is_err());
    }
}

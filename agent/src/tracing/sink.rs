//! Delivery of finished trace lines.

use std::sync::mpsc::{SyncSender, TrySendError};

use metracer_protocol::TraceLine;

/// Where the runtime hands finished lines.
///
/// Implementations must never block the traced thread for long and must not
/// call back into instrumented code.
pub trait MessageSink: Send + Sync {
    fn print_message(&self, class_name: &str, method_name: &str, line: &str);
}

/// Sink that pushes lines onto the batching channel drained by the flush
/// thread. When the channel is full or gone the line goes to stderr so a
/// dying bridge never silences the trace.
pub struct ChannelSink {
    tx: SyncSender<TraceLine>,
}

impl ChannelSink {
    pub fn new(tx: SyncSender<TraceLine>) -> Self {
        Self { tx }
    }
}

impl MessageSink for ChannelSink {
    fn print_message(&self, class_name: &str, method_name: &str, line: &str) {
        let event = TraceLine {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            line: line.to_string(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) | Err(TrySendError::Disconnected(e)) => {
                eprintln!("{}", e.line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_sink_delivers_lines() {
        let (tx, rx) = mpsc::sync_channel(4);
        let sink = ChannelSink::new(tx);
        sink.print_message("a.B", "m", "[metracer.00000001] +++ [0] a.B.m()");
        let got = rx.try_recv().unwrap();
        assert_eq!(got.class_name, "a.B");
        assert_eq!(got.method_name, "m");
        assert!(got.line.contains("+++"));
    }
}

// Per-request event streaming between producers (worker / download
// supervisors) and the HTTP handlers that re-emit frames as SSE.
//
// The channel is bounded. When it fills, log frames are dropped and
// progress frames are coalesced to the latest value; token, image,
// error, done, finished, and cancelled frames are never dropped.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::Attachment;

pub const CHANNEL_CAPACITY: usize = 256;
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// One wire frame. Chat streams emit token/image/error/done; download
/// streams additionally progress/log/finished/cancelled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelEvent {
    Token { token: String },
    Image { attachments: Vec<Attachment> },
    Error { message: String },
    Done { stats: Value },
    Progress { file: String, percent: u8 },
    Log { message: String },
    Finished { path: String },
    Cancelled,
}

impl ChannelEvent {
    /// Terminal frame: the handler stops reading after forwarding it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Done { .. })
    }

    fn is_log(&self) -> bool {
        matches!(self, ChannelEvent::Log { .. })
    }

    fn is_progress(&self) -> bool {
        matches!(self, ChannelEvent::Progress { .. })
    }
}

/// Render one SSE frame.
pub fn sse_frame(event: &ChannelEvent) -> String {
    let json = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","message":"serialize"}"#.to_string());
    format!("data: {json}\n\n")
}

/// Producer half with the backpressure policy applied.
pub struct EventSender {
    tx: mpsc::Sender<ChannelEvent>,
    pending_progress: Mutex<Option<ChannelEvent>>,
    block_timeout: Duration,
}

/// Create a bounded event channel with the default capacity.
pub fn event_channel() -> (EventSender, mpsc::Receiver<ChannelEvent>) {
    event_channel_with(CHANNEL_CAPACITY, BLOCK_TIMEOUT)
}

pub fn event_channel_with(
    capacity: usize,
    block_timeout: Duration,
) -> (EventSender, mpsc::Receiver<ChannelEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            tx,
            pending_progress: Mutex::new(None),
            block_timeout,
        },
        rx,
    )
}

impl EventSender {
    /// Send from a plain OS thread (worker reader, download reader).
    /// Returns false once the consumer is gone.
    pub fn send_blocking(&self, event: ChannelEvent) -> bool {
        if event.is_progress() {
            return self.send_progress(event);
        }

        // A non-progress frame supersedes any stale coalesced progress
        self.flush_or_discard_pending();

        if event.is_log() {
            return self.send_with_deadline(event);
        }

        // Critical frames block until the consumer makes room
        self.tx.blocking_send(event).is_ok()
    }

    /// Async flavor of `send_blocking` for tokio-task producers.
    pub async fn send(&self, event: ChannelEvent) -> bool {
        if event.is_progress() {
            return self.send_progress(event);
        }
        self.flush_or_discard_pending();

        if event.is_log() {
            return self
                .tx
                .send_timeout(event, self.block_timeout)
                .await
                .is_ok();
        }
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send_progress(&self, event: ChannelEvent) -> bool {
        // Try the stale value first to keep frames in order
        self.flush_or_discard_pending();
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                // Coalesce: the latest percent wins
                *self.pending_progress.lock().unwrap() = Some(event);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn flush_or_discard_pending(&self) {
        let pending = self.pending_progress.lock().unwrap().take();
        if let Some(event) = pending {
            if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
                // Still no room; put it back for the next attempt
                *self.pending_progress.lock().unwrap() = Some(event);
            }
        }
    }

    fn send_with_deadline(&self, mut event: ChannelEvent) -> bool {
        let deadline = Instant::now() + self.block_timeout;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(e)) => {
                    if Instant::now() >= deadline {
                        return true; // Dropped; log frames are expendable
                    }
                    event = e;
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sse_frame_format() {
        let frame = sse_frame(&ChannelEvent::Token {
            token: "hi".to_string(),
        });
        assert_eq!(frame, "data: {\"type\":\"token\",\"token\":\"hi\"}\n\n");
    }

    #[test]
    fn test_event_tags_match_wire_contract() {
        let cases = vec![
            (
                ChannelEvent::Progress {
                    file: "model.bin".to_string(),
                    percent: 42,
                },
                r#"{"type":"progress","file":"model.bin","percent":42}"#,
            ),
            (
                ChannelEvent::Done { stats: json!({"tokens": 3}) },
                r#"{"type":"done","stats":{"tokens":3}}"#,
            ),
            (ChannelEvent::Cancelled, r#"{"type":"cancelled"}"#),
            (
                ChannelEvent::Finished {
                    path: "/models/x".to_string(),
                },
                r#"{"type":"finished","path":"/models/x"}"#,
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(serde_json::to_string(&event).unwrap(), expected);
        }
    }

    #[test]
    fn test_log_frames_dropped_when_full() {
        let (tx, mut rx) = event_channel_with(1, Duration::from_millis(20));
        assert!(tx.send_blocking(ChannelEvent::Token {
            token: "t1".to_string()
        }));
        // Channel full: this log frame times out and is dropped
        assert!(tx.send_blocking(ChannelEvent::Log {
            message: "noise".to_string()
        }));

        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Token {
                token: "t1".to_string()
            })
        );
        drop(tx);
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_progress_coalesces_to_latest() {
        let (tx, mut rx) = event_channel_with(1, Duration::from_millis(20));
        assert!(tx.send_blocking(ChannelEvent::Progress {
            file: "a".to_string(),
            percent: 10
        }));
        // Full: these coalesce, keeping only the newest percent
        for percent in [20, 30, 40] {
            assert!(tx.send_blocking(ChannelEvent::Progress {
                file: "a".to_string(),
                percent
            }));
        }

        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Progress {
                file: "a".to_string(),
                percent: 10
            })
        );
        // Room now; next progress send flushes the coalesced 40 first
        assert!(tx.send_blocking(ChannelEvent::Progress {
            file: "a".to_string(),
            percent: 50
        }));
        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Progress {
                file: "a".to_string(),
                percent: 40
            })
        );
    }

    #[test]
    fn test_critical_frames_block_until_space() {
        let (tx, mut rx) = event_channel_with(1, Duration::from_millis(20));
        assert!(tx.send_blocking(ChannelEvent::Token {
            token: "t1".to_string()
        }));

        let handle = std::thread::spawn(move || {
            // Blocks until the reader below drains t1
            tx.send_blocking(ChannelEvent::Done { stats: json!({}) })
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Token {
                token: "t1".to_string()
            })
        );
        assert!(handle.join().unwrap());
        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Done { stats: json!({}) })
        );
    }

    #[test]
    fn test_stale_progress_discarded_before_terminal() {
        let (tx, mut rx) = event_channel_with(1, Duration::from_millis(20));
        assert!(tx.send_blocking(ChannelEvent::Progress {
            file: "a".to_string(),
            percent: 10
        }));
        assert!(tx.send_blocking(ChannelEvent::Progress {
            file: "a".to_string(),
            percent: 20
        })); // coalesced

        let handle = std::thread::spawn(move || {
            tx.send_blocking(ChannelEvent::Done { stats: json!({}) });
        });
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(
            rx.blocking_recv(),
            Some(ChannelEvent::Progress {
                file: "a".to_string(),
                percent: 10
            })
        );
        // The coalesced 20 may flush before done, but never after it
        let next = rx.blocking_recv().unwrap();
        if let ChannelEvent::Progress { percent, .. } = next {
            assert_eq!(percent, 20);
            assert!(rx.blocking_recv().unwrap().is_terminal());
        } else {
            assert!(next.is_terminal());
            assert_eq!(rx.blocking_recv(), None);
        }
        handle.join().unwrap();
    }
}

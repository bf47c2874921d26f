//! Track event types and the EventBus
//!
//! Every observable side effect of the playback engine is announced as a
//! `TrackEvent` on a broadcast bus. Embedders subscribe to drive delegates,
//! UI state, or logging; the engine never calls back into embedder code
//! directly.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Ability of a track to be used for playback.
///
/// `Failed` is terminal: the track can no longer play and a new one must be
/// created in its place. The cause is available from the track's `error`
/// accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    /// No media loaded yet (nothing prepared).
    Unknown,
    /// Prepared and able to play.
    ReadyToPlay,
    /// Unusable because of an unrecoverable error.
    Failed,
}

impl std::fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackStatus::Unknown => write!(f, "unknown"),
            TrackStatus::ReadyToPlay => write!(f, "ready"),
            TrackStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Playback events broadcast by the engine.
///
/// Events are emitted from the transport and the decode worker; none are
/// emitted from the real-time render context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackEvent {
    /// A prepared source is loaded and probed.
    SourceChanged {
        /// Track that loaded a source
        track_id: Uuid,
        /// Media duration in seconds (0.0 when the container does not say)
        duration: f64,
        /// When the source was prepared
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Output started (play or resume).
    StartedPlaying {
        /// Track that started
        track_id: Uuid,
        /// Media position at start, in seconds
        position: f64,
        /// When output started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Output stopped by the caller.
    StoppedPlaying {
        /// Track that stopped
        track_id: Uuid,
        /// When output stopped
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback reached its end, or was cut short.
    ///
    /// `success` is true only for natural end-of-stream completion.
    /// Caller-initiated stop and fatal errors report false.
    FinishedPlaying {
        /// Track that finished
        track_id: Uuid,
        /// Natural completion flag
        success: bool,
        /// When playback finished
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback wrapped from the end of the media back to the start.
    Looped {
        /// Track that looped
        track_id: Uuid,
        /// Remaining loop count after this wrap (-1 = infinite)
        loops_remaining: i32,
        /// When the wrap became audible
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A decode-path problem.
    ///
    /// Non-fatal reports (transient underruns, failed seeks) carry
    /// `fatal: false` and playback continues. `fatal: true` accompanies the
    /// transition to `TrackStatus::Failed`.
    DecodeError {
        /// Track that hit the error
        track_id: Uuid,
        /// Human-readable description
        message: String,
        /// Whether the track is now unusable
        fatal: bool,
        /// When the error was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The output device was reclaimed by the system while playing.
    ///
    /// The track has already been paused when this event is observed.
    InterruptionBegan {
        /// Track that was interrupted
        track_id: Uuid,
        /// Media position when the interruption began, in seconds
        position: f64,
        /// When the interruption began
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The interruption ended.
    ///
    /// `should_resume` reflects the system's hint; when set, a track that
    /// was auto-paused by the interruption resumes on its own.
    InterruptionEnded {
        /// Track the interruption applied to
        track_id: Uuid,
        /// System hint to resume playback
        should_resume: bool,
        /// When the interruption ended
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl TrackEvent {
    /// The track this event belongs to.
    pub fn track_id(&self) -> Uuid {
        match self {
            TrackEvent::SourceChanged { track_id, .. }
            | TrackEvent::StartedPlaying { track_id, .. }
            | TrackEvent::StoppedPlaying { track_id, .. }
            | TrackEvent::FinishedPlaying { track_id, .. }
            | TrackEvent::Looped { track_id, .. }
            | TrackEvent::DecodeError { track_id, .. }
            | TrackEvent::InterruptionBegan { track_id, .. }
            | TrackEvent::InterruptionEnded { track_id, .. } => *track_id,
        }
    }
}

/// Broadcast distribution bus for track events.
///
/// Wraps `tokio::sync::broadcast`: publishing never blocks, slow
/// subscribers lag rather than stall the engine, and receivers clean up
/// when dropped. A bus with no subscribers swallows events silently.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TrackEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: TrackEvent) {
        // Err means no subscribers, which is fine.
        if self.tx.send(event).is_err() {
            trace!("track event emitted with no subscribers");
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(track_id: Uuid) -> TrackEvent {
        TrackEvent::Looped {
            track_id,
            loops_remaining: 2,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit(sample_event(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.track_id(), id);
        match event {
            TrackEvent::Looped { loops_remaining, .. } => assert_eq!(loops_remaining, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(sample_event(Uuid::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_emit_from_plain_thread() {
        // The decode worker is a plain std thread; sending must not need a
        // runtime.
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let bus2 = bus.clone();
        let id = Uuid::new_v4();

        std::thread::spawn(move || bus2.emit(sample_event(id)))
            .join()
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.track_id(), id);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = TrackEvent::FinishedPlaying {
            track_id: Uuid::new_v4(),
            success: true,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"FinishedPlaying\""));
        assert!(json.contains("\"success\":true"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TrackStatus::Unknown.to_string(), "unknown");
        assert_eq!(TrackStatus::ReadyToPlay.to_string(), "ready");
        assert_eq!(TrackStatus::Failed.to_string(), "failed");
    }
}

//! Track registry
//!
//! An explicit registry object: constructed once by the embedder and
//! passed by reference to whatever needs to enumerate live tracks or fan
//! out device interruptions. There is no process-wide singleton; dropping
//! the registry does not affect the tracks, which are held weakly.

use crate::playback::transport::{AudioTrack, InterruptionEvent, TrackHandle};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Weak collection of live tracks.
#[derive(Default)]
pub struct TrackRegistry {
    tracks: Mutex<Vec<(Uuid, TrackHandle)>>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track. Re-registering the same track is a no-op.
    pub fn register(&self, track: &AudioTrack) {
        let mut tracks = self.tracks.lock().unwrap();
        if tracks.iter().any(|(id, _)| *id == track.id()) {
            return;
        }
        tracks.push((track.id(), track.handle()));
        debug!("Registered track {} ({} live)", track.id(), tracks.len());
    }

    /// Remove a track by id.
    pub fn unregister(&self, id: Uuid) {
        self.tracks.lock().unwrap().retain(|(tid, _)| *tid != id);
    }

    /// Upgraded handles for every still-living track, pruning dead ones.
    pub fn tracks(&self) -> Vec<AudioTrack> {
        let mut tracks = self.tracks.lock().unwrap();
        tracks.retain(|(_, handle)| handle.upgrade().is_some());
        tracks
            .iter()
            .filter_map(|(_, handle)| handle.upgrade())
            .collect()
    }

    /// Number of registered (possibly dead) entries.
    pub fn len(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan an interruption start out to every live track.
    pub fn begin_interruption(&self) {
        for track in self.tracks() {
            track.handle_interruption(InterruptionEvent::Began);
        }
    }

    /// Fan an interruption end out to every live track.
    pub fn end_interruption(&self, should_resume: bool) {
        for track in self.tracks() {
            track.handle_interruption(InterruptionEvent::Ended { should_resume });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::QueueBackend;
    use crate::audio::types::{AudioSpec, TrackSource};
    use crate::config::EngineConfig;

    fn track() -> AudioTrack {
        AudioTrack::with_backend(
            TrackSource::Path("/tmp/registry-test.wav".into()),
            EngineConfig::default(),
            Box::new(QueueBackend::new(AudioSpec::new(44100, 2))),
        )
    }

    #[test]
    fn test_register_and_enumerate() {
        let registry = TrackRegistry::new();
        assert!(registry.is_empty());

        let a = track();
        let b = track();
        registry.register(&a);
        registry.register(&a); // duplicate ignored
        registry.register(&b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tracks().len(), 2);

        registry.unregister(a.id());
        assert_eq!(registry.tracks().len(), 1);
        assert_eq!(registry.tracks()[0].id(), b.id());
    }

    #[test]
    fn test_dead_tracks_are_pruned() {
        let registry = TrackRegistry::new();
        let a = track();
        registry.register(&a);
        drop(a);
        assert_eq!(registry.tracks().len(), 0);
        assert!(registry.is_empty());
    }
}

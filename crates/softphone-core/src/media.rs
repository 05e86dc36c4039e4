//! Remote audio binding
//!
//! The [`MediaBinder`] sits between the call controller and the platform
//! media subsystem ([`MediaBackend`]). It plays remote tracks through one
//! reused [`AudioSink`], tries early media on provisional responses, turns an
//! autoplay-policy refusal into a recoverable [`MediaEvent::PlaybackBlocked`],
//! and samples the signal level so silence can be reported. None of this ever
//! fails a call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::call::CallId;
use crate::events::{EventChannel, MediaEvent};
use crate::stack::{DialogHandle, RemoteTrack};

/// Why the sink refused to play
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Autoplay-style policy: playback needs a user gesture first
    #[error("playback requires user interaction")]
    NotAllowed,
    #[error("playback failed: {0}")]
    Failed(String),
}

/// The playback element remote audio is rendered through
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn set_muted(&self, muted: bool);
    fn set_volume(&self, volume: f32);
    async fn play(&self, track: &RemoteTrack) -> Result<(), PlaybackError>;
    async fn stop(&self);
    /// Current output level, 0.0 is silence
    fn signal_level(&self) -> f32;
}

/// Platform media subsystem
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Create the playback sink; called once per binder
    fn create_sink(&self) -> Arc<dyn AudioSink>;
    /// Remote tracks already live on the dialog
    async fn live_remote_tracks(&self, handle: &DialogHandle) -> Vec<RemoteTrack>;
    /// Stop local capture for the dialog
    async fn release_local(&self, handle: &DialogHandle);
}

#[derive(Debug, Clone)]
struct Pending {
    call_id: CallId,
    track: RemoteTrack,
}

/// Binds remote audio for the calls of one softphone
pub struct MediaBinder {
    backend: Arc<dyn MediaBackend>,
    events: EventChannel<MediaEvent>,
    sink: Mutex<Option<Arc<dyn AudioSink>>>,
    /// Call whose remote audio the sink is playing
    bound: Mutex<Option<CallId>>,
    blocked: Mutex<Option<Pending>>,
    monitors: Mutex<HashMap<DialogHandle, JoinHandle<()>>>,
    sample_interval: Duration,
    silent_threshold: u32,
}

impl MediaBinder {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        events: EventChannel<MediaEvent>,
        sample_interval: Duration,
        silent_threshold: u32,
    ) -> Self {
        Self {
            backend,
            events,
            sink: Mutex::new(None),
            bound: Mutex::new(None),
            blocked: Mutex::new(None),
            monitors: Mutex::new(HashMap::new()),
            sample_interval,
            silent_threshold: silent_threshold.max(1),
        }
    }

    fn sink(&self) -> Arc<dyn AudioSink> {
        let mut slot = self.sink.lock();
        let sink = slot.get_or_insert_with(|| self.backend.create_sink()).clone();
        sink.set_muted(false);
        sink.set_volume(1.0);
        sink
    }

    /// Play a remote track; returns whether audio is now playing
    pub async fn bind_track(&self, call_id: CallId, track: RemoteTrack) -> bool {
        if !track.kind.eq_ignore_ascii_case("audio") {
            debug!(call_id = %call_id, kind = %track.kind, "Ignoring non-audio remote track");
            return false;
        }

        let sink = self.sink();
        match sink.play(&track).await {
            Ok(()) => {
                info!(call_id = %call_id, track = %track.id, "Remote audio bound");
                *self.bound.lock() = Some(call_id);
                self.blocked.lock().take();
                self.events.emit(MediaEvent::RemoteAudioBound { call_id });
                true
            }
            Err(PlaybackError::NotAllowed) => {
                let first = {
                    let mut blocked = self.blocked.lock();
                    let first = blocked.is_none();
                    *blocked = Some(Pending { call_id, track });
                    first
                };
                if first {
                    warn!(call_id = %call_id, "Playback blocked until user interaction");
                    self.events.emit(MediaEvent::PlaybackBlocked { call_id });
                }
                false
            }
            Err(PlaybackError::Failed(reason)) => {
                warn!(call_id = %call_id, reason = %reason, "Remote audio playback failed");
                self.events.emit(MediaEvent::Warning {
                    call_id: Some(call_id),
                    message: reason,
                });
                false
            }
        }
    }

    /// Bind whatever remote audio the dialog already has
    pub async fn bind_session(&self, call_id: CallId, handle: &DialogHandle) -> bool {
        let tracks = self.backend.live_remote_tracks(handle).await;
        let Some(track) = tracks.into_iter().find(|t| t.kind.eq_ignore_ascii_case("audio")) else {
            debug!(call_id = %call_id, "No live remote audio to bind yet");
            return false;
        };
        self.bind_track(call_id, track).await
    }

    /// Best-effort early media on 180/183; failures are only logged
    pub async fn try_early_media(&self, call_id: CallId, handle: &DialogHandle) {
        let tracks = self.backend.live_remote_tracks(handle).await;
        let Some(track) = tracks.into_iter().find(|t| t.kind.eq_ignore_ascii_case("audio")) else {
            debug!(call_id = %call_id, "No early media available");
            return;
        };
        if self.bind_track(call_id, track).await {
            self.events.emit(MediaEvent::EarlyMediaStarted { call_id });
        }
    }

    /// Retry blocked playback after the user interacted with the page/app
    pub async fn resume_playback(&self) -> bool {
        let Some(pending) = self.blocked.lock().take() else {
            return false;
        };
        let call_id = pending.call_id;
        if self.bind_track(pending.call_id, pending.track).await {
            self.events.emit(MediaEvent::PlaybackResumed { call_id });
            true
        } else {
            false
        }
    }

    pub fn playback_blocked(&self) -> bool {
        self.blocked.lock().is_some()
    }

    /// Start sampling the output level for a session
    pub fn start_level_monitor(&self, call_id: CallId, handle: DialogHandle) {
        let sink = self.sink();
        let events = self.events.clone();
        let every = self.sample_interval;
        let threshold = self.silent_threshold;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut silent = 0u32;
            loop {
                ticker.tick().await;
                if sink.signal_level() > 0.0 {
                    silent = 0;
                    continue;
                }
                silent += 1;
                if silent == threshold {
                    let silent_for = every * threshold;
                    warn!(call_id = %call_id, silent_ms = silent_for.as_millis() as u64, "No audio signal");
                    events.emit(MediaEvent::NoAudioSignal { call_id, silent_for });
                }
            }
        });

        if let Some(previous) = self.monitors.lock().insert(handle, task) {
            previous.abort();
        }
    }

    /// Stop sampling and release media for a finished session
    pub async fn release(&self, call_id: CallId, handle: &DialogHandle) {
        if let Some(task) = self.monitors.lock().remove(handle) {
            task.abort();
        }
        {
            let mut blocked = self.blocked.lock();
            if blocked.as_ref().is_some_and(|p| p.call_id == call_id) {
                blocked.take();
            }
        }

        // the sink may be playing another call's audio
        let owned = {
            let mut bound = self.bound.lock();
            if *bound == Some(call_id) {
                bound.take();
                true
            } else {
                false
            }
        };
        let sink = if owned { self.sink.lock().clone() } else { None };
        if let Some(sink) = sink {
            sink.stop().await;
        }
        self.backend.release_local(handle).await;
        debug!(call_id = %call_id, "Media released");
    }

    /// Call currently playing through the sink
    pub fn bound_call(&self) -> Option<CallId> {
        *self.bound.lock()
    }

    pub fn monitored_sessions(&self) -> usize {
        self.monitors.lock().len()
    }
}

impl Drop for MediaBinder {
    fn drop(&mut self) {
        for (_, task) in self.monitors.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct TestSink {
        allow: AtomicBool,
        plays: AtomicU32,
        stops: AtomicU32,
        level_milli: AtomicU32,
    }

    #[async_trait]
    impl AudioSink for TestSink {
        fn set_muted(&self, _muted: bool) {}
        fn set_volume(&self, _volume: f32) {}

        async fn play(&self, _track: &RemoteTrack) -> Result<(), PlaybackError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            if self.allow.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PlaybackError::NotAllowed)
            }
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn signal_level(&self) -> f32 {
            self.level_milli.load(Ordering::SeqCst) as f32 / 1000.0
        }
    }

    struct TestBackend {
        sink: Arc<TestSink>,
        sinks_created: AtomicU32,
    }

    #[async_trait]
    impl MediaBackend for TestBackend {
        fn create_sink(&self) -> Arc<dyn AudioSink> {
            self.sinks_created.fetch_add(1, Ordering::SeqCst);
            self.sink.clone()
        }

        async fn live_remote_tracks(&self, _handle: &DialogHandle) -> Vec<RemoteTrack> {
            vec![RemoteTrack { id: "t1".into(), kind: "audio".into() }]
        }

        async fn release_local(&self, _handle: &DialogHandle) {}
    }

    fn binder() -> (MediaBinder, Arc<TestBackend>, EventBus) {
        let bus = EventBus::new(16);
        let backend = Arc::new(TestBackend {
            sink: Arc::new(TestSink::default()),
            sinks_created: AtomicU32::new(0),
        });
        let binder = MediaBinder::new(backend.clone(), bus.media.clone(), Duration::from_secs(1), 3);
        (binder, backend, bus)
    }

    #[tokio::test]
    async fn test_blocked_playback_is_recoverable() {
        let (binder, backend, bus) = binder();
        let mut events = bus.media.subscribe();
        let call_id = Uuid::new_v4();
        let handle = DialogHandle::new();

        assert!(!binder.bind_session(call_id, &handle).await);
        assert_eq!(events.recv().await.unwrap(), MediaEvent::PlaybackBlocked { call_id });
        assert!(binder.playback_blocked());

        // a second refusal does not repeat the notice
        assert!(!binder.bind_session(call_id, &handle).await);
        assert!(events.try_recv().is_err());

        backend.sink.allow.store(true, Ordering::SeqCst);
        assert!(binder.resume_playback().await);
        assert_eq!(events.recv().await.unwrap(), MediaEvent::RemoteAudioBound { call_id });
        assert_eq!(events.recv().await.unwrap(), MediaEvent::PlaybackResumed { call_id });
        assert_eq!(backend.sinks_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_warning_once_per_streak() {
        let (binder, _backend, bus) = binder();
        let mut events = bus.media.subscribe();
        let call_id = Uuid::new_v4();
        let handle = DialogHandle::new();

        binder.start_level_monitor(call_id, handle.clone());
        tokio::time::sleep(Duration::from_millis(5500)).await;

        assert_eq!(
            events.recv().await.unwrap(),
            MediaEvent::NoAudioSignal { call_id, silent_for: Duration::from_secs(3) }
        );
        assert!(events.try_recv().is_err());

        binder.release(call_id, &handle).await;
        assert_eq!(binder.monitored_sessions(), 0);
    }

    #[tokio::test]
    async fn test_release_only_stops_the_bound_call() {
        let (binder, backend, _bus) = binder();
        backend.sink.allow.store(true, Ordering::SeqCst);
        let active = Uuid::new_v4();
        let ringing = Uuid::new_v4();
        let active_handle = DialogHandle::new();

        assert!(binder.bind_session(active, &active_handle).await);
        assert_eq!(binder.bound_call(), Some(active));

        binder.release(ringing, &DialogHandle::new()).await;
        assert_eq!(backend.sink.stops.load(Ordering::SeqCst), 0);
        assert_eq!(binder.bound_call(), Some(active));

        binder.release(active, &active_handle).await;
        assert_eq!(backend.sink.stops.load(Ordering::SeqCst), 1);
        assert_eq!(binder.bound_call(), None);
    }
}

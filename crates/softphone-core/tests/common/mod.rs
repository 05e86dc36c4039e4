//! Shared test harness: a scripted user agent and a permissive media backend

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use url::Url;

use rvoip_softphone_core::stack::{
    DialogCapabilities, DialogHandle, DialogId, InviteRequest, MediaConstraints, RegisterRequest, RemoteTrack,
};
use rvoip_softphone_core::{
    AudioSink, EndpointConfig, IceServer, MediaBackend, PhoneConfig, PlaybackError, Softphone, StackEvent,
    StackEventSender, UserAgent,
};

pub const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 192.0.2.10\r\n\
s=-\r\n\
c=IN IP4 192.0.2.10\r\n\
t=0 0\r\n\
m=audio 49170 RTP/AVP 0 8 111\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

/// What the softphone asked the stack to do
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    ConnectTransport(String),
    DisconnectTransport,
    Keepalive,
    Register(RegisterRequest),
    Unregister,
    Invite(InviteRequest),
    Accept(DialogHandle),
    Reject(DialogHandle, u16),
    Cancel(DialogHandle),
    Bye(DialogHandle),
    NativeHold(DialogHandle, bool),
    Renegotiate(DialogHandle, String),
    SenderEnabled(DialogHandle, bool),
    Refer(DialogHandle, String),
}

/// How the scripted registrar answers REGISTER
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegistrarScript {
    Accept(u32),
    Reject(u16),
    Silent,
}

pub struct MockUserAgent {
    sender: Mutex<Option<StackEventSender>>,
    ops: Mutex<Vec<Op>>,
    pub transport_up: AtomicBool,
    pub answer_transport: AtomicBool,
    pub fail_transport: AtomicBool,
    pub registrar: Mutex<RegistrarScript>,
    pub capabilities: Mutex<DialogCapabilities>,
    pub local_sdp: Mutex<Option<String>>,
    pub fail_invite: AtomicBool,
    pub fail_reject: AtomicBool,
    pub fail_refer: AtomicBool,
    pub fail_hold: AtomicBool,
    pub connect_attempts: AtomicU32,
}

impl MockUserAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
            transport_up: AtomicBool::new(false),
            answer_transport: AtomicBool::new(true),
            fail_transport: AtomicBool::new(false),
            registrar: Mutex::new(RegistrarScript::Accept(300)),
            capabilities: Mutex::new(DialogCapabilities {
                native_hold: true,
                renegotiation: true,
            }),
            local_sdp: Mutex::new(Some(OFFER.to_string())),
            fail_invite: AtomicBool::new(false),
            fail_reject: AtomicBool::new(false),
            fail_refer: AtomicBool::new(false),
            fail_hold: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
        })
    }

    /// Push an event as if the network produced it
    pub fn emit(&self, event: StackEvent) {
        if let Some(sender) = self.sender.lock().as_ref() {
            sender.send(event).expect("dispatcher alive");
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn count(&self, matches: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| matches(op)).count()
    }

    pub fn register_count(&self) -> usize {
        self.count(|op| matches!(op, Op::Register(_)))
    }

    pub fn last_invite(&self) -> Option<InviteRequest> {
        self.ops.lock().iter().rev().find_map(|op| match op {
            Op::Invite(request) => Some(request.clone()),
            _ => None,
        })
    }

    /// Drop the transport from the network side
    pub fn drop_transport(&self, reason: &str) {
        self.transport_up.store(false, Ordering::SeqCst);
        self.emit(StackEvent::TransportDisconnected {
            reason: Some(reason.to_string()),
        });
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl UserAgent for MockUserAgent {
    fn attach(&self, events: StackEventSender) {
        *self.sender.lock() = Some(events);
    }

    async fn connect_transport(&self, uri: &Url, _ice_servers: &[IceServer]) -> anyhow::Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.record(Op::ConnectTransport(uri.to_string()));
        if self.fail_transport.load(Ordering::SeqCst) {
            self.emit(StackEvent::TransportError {
                reason: "connection refused".into(),
            });
            return Ok(());
        }
        if self.answer_transport.load(Ordering::SeqCst) {
            self.transport_up.store(true, Ordering::SeqCst);
            self.emit(StackEvent::TransportConnected);
        }
        Ok(())
    }

    async fn disconnect_transport(&self) -> anyhow::Result<()> {
        self.record(Op::DisconnectTransport);
        self.transport_up.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_transport_connected(&self) -> bool {
        self.transport_up.load(Ordering::SeqCst)
    }

    async fn send_keepalive(&self) -> anyhow::Result<()> {
        self.record(Op::Keepalive);
        Ok(())
    }

    async fn register(&self, request: &RegisterRequest) -> anyhow::Result<()> {
        self.record(Op::Register(request.clone()));
        match *self.registrar.lock() {
            RegistrarScript::Accept(expires) => self.emit(StackEvent::Registered { expires }),
            RegistrarScript::Reject(status) => self.emit(StackEvent::RegistrationFailed {
                status: Some(status),
                reason: "Forbidden".into(),
            }),
            RegistrarScript::Silent => {}
        }
        Ok(())
    }

    async fn unregister(&self) -> anyhow::Result<()> {
        self.record(Op::Unregister);
        Ok(())
    }

    async fn create_offer(&self, _constraints: MediaConstraints) -> anyhow::Result<String> {
        Ok(OFFER.to_string())
    }

    async fn invite(&self, request: InviteRequest) -> anyhow::Result<()> {
        self.record(Op::Invite(request));
        if self.fail_invite.load(Ordering::SeqCst) {
            anyhow::bail!("transport closed");
        }
        Ok(())
    }

    async fn accept(&self, handle: &DialogHandle) -> anyhow::Result<()> {
        self.record(Op::Accept(handle.clone()));
        Ok(())
    }

    async fn reject(&self, handle: &DialogHandle, status: u16) -> anyhow::Result<()> {
        self.record(Op::Reject(handle.clone(), status));
        if self.fail_reject.load(Ordering::SeqCst) {
            anyhow::bail!("invalid state for reject");
        }
        Ok(())
    }

    async fn cancel(&self, handle: &DialogHandle) -> anyhow::Result<()> {
        self.record(Op::Cancel(handle.clone()));
        Ok(())
    }

    async fn bye(&self, handle: &DialogHandle) -> anyhow::Result<()> {
        self.record(Op::Bye(handle.clone()));
        Ok(())
    }

    fn capabilities(&self, _handle: &DialogHandle) -> DialogCapabilities {
        *self.capabilities.lock()
    }

    async fn set_native_hold(&self, handle: &DialogHandle, hold: bool) -> anyhow::Result<()> {
        self.record(Op::NativeHold(handle.clone(), hold));
        if self.fail_hold.load(Ordering::SeqCst) {
            anyhow::bail!("488 Not Acceptable Here");
        }
        Ok(())
    }

    async fn local_description(&self, _handle: &DialogHandle) -> anyhow::Result<Option<String>> {
        Ok(self.local_sdp.lock().clone())
    }

    async fn renegotiate(&self, handle: &DialogHandle, sdp: String) -> anyhow::Result<()> {
        self.record(Op::Renegotiate(handle.clone(), sdp));
        if self.fail_hold.load(Ordering::SeqCst) {
            anyhow::bail!("488 Not Acceptable Here");
        }
        Ok(())
    }

    async fn set_audio_sender_enabled(&self, handle: &DialogHandle, enabled: bool) -> anyhow::Result<()> {
        self.record(Op::SenderEnabled(handle.clone(), enabled));
        Ok(())
    }

    async fn refer(&self, handle: &DialogHandle, refer_to: &str) -> anyhow::Result<()> {
        self.record(Op::Refer(handle.clone(), refer_to.to_string()));
        if self.fail_refer.load(Ordering::SeqCst) {
            anyhow::bail!("603 Declined");
        }
        Ok(())
    }
}

/// Shared sink that remembers which remote track it is rendering
#[derive(Default)]
pub struct MockSink {
    pub plays: AtomicU32,
    pub stops: AtomicU32,
    pub playing: Mutex<Option<String>>,
}

#[async_trait]
impl AudioSink for MockSink {
    fn set_muted(&self, _muted: bool) {}
    fn set_volume(&self, _volume: f32) {}

    async fn play(&self, track: &RemoteTrack) -> Result<(), PlaybackError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        *self.playing.lock() = Some(track.id.clone());
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.lock().take();
    }

    fn signal_level(&self) -> f32 {
        0.5
    }
}

#[derive(Default)]
pub struct MockMedia {
    pub sink: Arc<MockSink>,
    pub released: Mutex<Vec<DialogHandle>>,
}

impl MockMedia {
    pub fn track_id(handle: &DialogHandle) -> String {
        format!("remote-audio-{handle}")
    }

    /// Whether the sink is rendering this dialog's remote audio
    pub fn is_playing(&self, handle: &DialogHandle) -> bool {
        self.sink.playing.lock().as_deref() == Some(Self::track_id(handle).as_str())
    }

    pub fn stops(&self) -> u32 {
        self.sink.stops.load(Ordering::SeqCst)
    }

    pub fn plays(&self) -> u32 {
        self.sink.plays.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for MockMedia {
    fn create_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    async fn live_remote_tracks(&self, handle: &DialogHandle) -> Vec<RemoteTrack> {
        vec![RemoteTrack {
            id: MockMedia::track_id(handle),
            kind: "audio".into(),
        }]
    }

    async fn release_local(&self, handle: &DialogHandle) {
        self.released.lock().push(handle.clone());
    }
}

pub fn endpoint() -> EndpointConfig {
    EndpointConfig::new("1001", "pbx.example.com", "s3cret")
}

pub fn dialog(call_id: &str) -> DialogId {
    DialogId {
        call_id: call_id.to_string(),
        local_tag: "1928301774".to_string(),
        remote_tag: "a6c85cf".to_string(),
    }
}

pub struct Harness {
    pub phone: Arc<Softphone>,
    pub stack: Arc<MockUserAgent>,
    pub media: Arc<MockMedia>,
}

/// Routes crate logs to the test writer; set RUST_LOG to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn harness(config: PhoneConfig) -> Harness {
    init_tracing();
    let stack = MockUserAgent::new();
    let media = Arc::new(MockMedia::default());
    let phone = Softphone::builder()
        .stack(stack.clone())
        .media(media.clone())
        .config(config)
        .build()
        .await
        .expect("softphone builds");
    Harness { phone, stack, media }
}

/// A softphone that is connected and registered
pub async fn connected(config: PhoneConfig) -> Harness {
    let h = harness(config).await;
    h.phone.connect(endpoint()).await.expect("connect");
    h
}

/// Let the dispatcher and spawned tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wait for the first event matching `pred`, skipping others
pub async fn wait_for<T: Clone>(rx: &mut broadcast::Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event arrived in time")
}

/// Every event currently buffered
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Place an outbound call and drive it to Established
pub async fn established_outbound(h: &Harness, number: &str) -> (rvoip_softphone_core::CallId, DialogHandle) {
    let call_id = h
        .phone
        .make_call(number, Default::default())
        .await
        .expect("make_call");
    let handle = h.stack.last_invite().expect("invite sent").handle;
    h.stack.emit(StackEvent::Established {
        handle: handle.clone(),
        dialog: dialog("a84b4c76e66710@pc33.example.com"),
    });
    settle().await;
    (call_id, handle)
}

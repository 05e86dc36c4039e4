//! The SIP stack seam
//!
//! The softphone never parses SIP itself. It drives a conformant user agent
//! through [`UserAgent`] and learns about protocol outcomes from
//! [`StackEvent`]s the stack pushes into the sender handed over by
//! [`UserAgent::attach`]. Events are consumed in order by one dispatcher task
//! per [`Softphone`](crate::Softphone).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::config::IceServer;

/// Sender the stack uses to report protocol outcomes
pub type StackEventSender = mpsc::UnboundedSender<StackEvent>;

/// Opaque handle naming one INVITE dialog (or attempt) between the softphone and the stack
///
/// Handles for outbound calls are minted by the softphone before the INVITE is
/// sent so events racing the `invite` return are still attributable; handles
/// for inbound calls are minted by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogHandle(pub String);

impl DialogHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for DialogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifiers of a confirmed dialog (call-id plus tags)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

/// Contact parameters for a single-contact registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPolicy {
    /// Maximum number of contacts we keep bound (always 1)
    pub max_contacts: u32,
    /// Ask the registrar to drop other bindings for this AOR
    pub remove_existing: bool,
    /// RFC 5626 `reg-id`
    pub reg_id: u32,
    /// RFC 5626 `+sip.instance` value, `<urn:uuid:...>`
    pub instance: String,
}

/// A REGISTER to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub aor: String,
    pub registrar: String,
    pub username: String,
    pub secret: String,
    pub expires: u32,
    pub contact: ContactPolicy,
    pub user_agent: Option<String>,
}

/// An outbound INVITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    pub handle: DialogHandle,
    pub target: String,
    pub display_name: Option<String>,
    pub offer: String,
    pub extra_headers: Vec<(String, String)>,
}

/// What the local offer may contain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self { audio: true, video: false }
    }
}

/// Remote media track surfaced by the media subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
}

/// Protocol outcomes reported by the stack
#[derive(Debug, Clone)]
pub enum StackEvent {
    /// Signaling transport is up
    TransportConnected,
    /// Signaling transport went away
    TransportDisconnected { reason: Option<String> },
    /// Transport could not be opened
    TransportError { reason: String },
    /// Registrar accepted the REGISTER
    Registered { expires: u32 },
    /// Registration removed (unregister finished or expired)
    Unregistered,
    /// Registrar rejected the REGISTER or it timed out
    RegistrationFailed { status: Option<u16>, reason: String },
    /// The stack disposed of its registerer
    RegistrationTerminated,
    /// New inbound INVITE
    IncomingInvite {
        handle: DialogHandle,
        remote_identity: String,
        display_name: Option<String>,
    },
    /// 1xx on an outbound INVITE
    Provisional { handle: DialogHandle, status: u16, reason: String },
    /// Dialog confirmed (200 OK / ACK)
    Established { handle: DialogHandle, dialog: DialogId },
    /// Final failure response to an outbound INVITE
    Rejected { handle: DialogHandle, status: u16, reason: String },
    /// Remote BYE
    RemoteBye { handle: DialogHandle },
    /// Remote CANCEL of an inbound INVITE
    RemoteCancel { handle: DialogHandle },
    /// The stack gave up on the dialog
    SessionError { handle: DialogHandle, reason: String },
    /// In-dialog NOTIFY for a REFER subscription
    Notify { handle: DialogHandle, body: String },
    /// Remote track became available
    RemoteTrack { handle: DialogHandle, track: RemoteTrack },
}

/// Capabilities of one dialog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialogCapabilities {
    /// The dialog exposes a hold primitive of its own
    pub native_hold: bool,
    /// The dialog can send a re-INVITE with a caller-supplied description
    pub renegotiation: bool,
}

/// The low-level SIP user agent the softphone drives
///
/// Implementations own transactions, dialogs and SDP generation. Methods
/// return once the request has been handed to the network; outcomes arrive as
/// [`StackEvent`]s.
#[async_trait]
pub trait UserAgent: Send + Sync {
    /// Give the stack the channel for its events. Called once by the builder.
    fn attach(&self, events: StackEventSender);

    /// Start opening the signaling transport
    async fn connect_transport(&self, uri: &Url, ice_servers: &[IceServer]) -> anyhow::Result<()>;

    /// Close the signaling transport
    async fn disconnect_transport(&self) -> anyhow::Result<()>;

    /// Whether the transport is currently open (used by health checks)
    async fn is_transport_connected(&self) -> bool;

    /// Send a keep-alive over the transport
    async fn send_keepalive(&self) -> anyhow::Result<()>;

    /// Send REGISTER
    async fn register(&self, request: &RegisterRequest) -> anyhow::Result<()>;

    /// Send REGISTER with expires=0
    async fn unregister(&self) -> anyhow::Result<()>;

    /// Build a local offer for a new call
    async fn create_offer(&self, constraints: MediaConstraints) -> anyhow::Result<String>;

    /// Send INVITE
    async fn invite(&self, request: InviteRequest) -> anyhow::Result<()>;

    /// Answer an inbound INVITE with 200 OK
    async fn accept(&self, handle: &DialogHandle) -> anyhow::Result<()>;

    /// Answer an inbound INVITE with a final failure
    async fn reject(&self, handle: &DialogHandle, status: u16) -> anyhow::Result<()>;

    /// CANCEL an outbound INVITE
    async fn cancel(&self, handle: &DialogHandle) -> anyhow::Result<()>;

    /// BYE a confirmed dialog
    async fn bye(&self, handle: &DialogHandle) -> anyhow::Result<()>;

    /// What the dialog supports for hold
    fn capabilities(&self, handle: &DialogHandle) -> DialogCapabilities;

    /// Native hold/resume
    async fn set_native_hold(&self, handle: &DialogHandle, hold: bool) -> anyhow::Result<()>;

    /// Current local description of the dialog, if any
    async fn local_description(&self, handle: &DialogHandle) -> anyhow::Result<Option<String>>;

    /// Send a re-INVITE carrying `sdp`
    async fn renegotiate(&self, handle: &DialogHandle, sdp: String) -> anyhow::Result<()>;

    /// Enable or disable the outbound audio sender without signaling
    async fn set_audio_sender_enabled(&self, handle: &DialogHandle, enabled: bool) -> anyhow::Result<()>;

    /// Send REFER; returns once the REFER was accepted (202)
    async fn refer(&self, handle: &DialogHandle, refer_to: &str) -> anyhow::Result<()>;
}

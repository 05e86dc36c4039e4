//! # Softphone Core - SIP endpoint call control
//!
//! This crate turns a low-level SIP user agent into a softphone: one endpoint
//! that registers with a PBX, places and receives a single live call, holds,
//! transfers (blind and attended), binds remote audio, and keeps its
//! connections alive.
//!
//! - **Registration** - connect/register/disconnect with throttled, call-aware refreshes
//! - **Calls** - make/answer/reject/end, hold/unhold, one terminal event per call
//! - **Transfer** - REFER with NOTIFY tracking, attended transfer with `Replaces`
//! - **Media** - remote audio binding, early media, playback-blocked recovery
//! - **Resilience** - exponential backoff, health checks, heartbeats, lifecycle guard
//!
//! The SIP stack ([`UserAgent`]) and the media subsystem ([`MediaBackend`])
//! are traits, so the crate never speaks SIP on the wire itself.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_softphone_core::{CallEvent, CallOptions, EndpointConfig, MediaBackend, Softphone, UserAgent};
//!
//! # async fn example(stack: Arc<dyn UserAgent>, media: Arc<dyn MediaBackend>) -> rvoip_softphone_core::PhoneResult<()> {
//! let phone = Softphone::builder().stack(stack).media(media).build().await?;
//! let mut calls = phone.subscribe_calls();
//!
//! phone
//!     .connect(EndpointConfig::new("1001", "pbx.example.com", "s3cret"))
//!     .await?;
//! let call_id = phone.make_call("1002", CallOptions::default()).await?;
//!
//! while let Ok(event) = calls.recv().await {
//!     if let CallEvent::Established { .. } = event {
//!         phone.end_call().await?;
//!     }
//!     if let CallEvent::Ended { call_id: ended, .. } = event {
//!         if ended == call_id {
//!             break;
//!         }
//!     }
//! }
//! phone.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod phone;
pub mod registration;
pub mod resilience;
pub mod sdp;
pub mod stack;
pub mod transfer;

// Re-export main types
pub use backend::{CallMonitor, CallRecord, Directory, TransferTarget};
pub use call::{CallDirection, CallId, CallInfo, CallOptions, CallState, EndCause, HoldMethod, SessionRole};
pub use config::{EndpointConfig, IceServer, PhoneConfig, ResilienceConfig};
pub use error::{PhoneError, PhoneResult, TransferFailure};
pub use events::{CallEvent, ConnectionEvent, EventBus, MediaEvent, RegistrationEvent, TransferEvent};
pub use media::{AudioSink, MediaBackend, PlaybackError};
pub use phone::{Softphone, SoftphoneBuilder};
pub use registration::{RegistrationInfo, RegistrationState};
pub use resilience::{Channel, ChannelDriver, ConnectionState, Health, LifecyclePhase};
pub use stack::{DialogHandle, DialogId, StackEvent, StackEventSender, UserAgent};
pub use transfer::{TransferMode, TransferState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Builder for [`Softphone`]
//!
//! # Examples
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use rvoip_softphone_core::{Softphone, PhoneConfig, UserAgent, MediaBackend};
//! # async fn example(stack: Arc<dyn UserAgent>, media: Arc<dyn MediaBackend>) -> rvoip_softphone_core::PhoneResult<()> {
//! let phone = Softphone::builder()
//!     .stack(stack)
//!     .media(media)
//!     .config(PhoneConfig::default())
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use super::{RegistrationCell, SignalingDriver, Softphone};
use crate::backend::{CallMonitor, Directory};
use crate::call::CallTable;
use crate::config::PhoneConfig;
use crate::error::{PhoneError, PhoneResult};
use crate::events::EventBus;
use crate::media::{MediaBackend, MediaBinder};
use crate::resilience::{Channel, ChannelDriver, ConnectionResilience, LifecyclePhase};
use crate::stack::UserAgent;

/// Builder for creating a softphone
pub struct SoftphoneBuilder {
    config: PhoneConfig,
    stack: Option<Arc<dyn UserAgent>>,
    media: Option<Arc<dyn MediaBackend>>,
    directory: Option<Arc<dyn Directory>>,
    monitor: Option<Arc<dyn CallMonitor>>,
    auxiliary: Option<Arc<dyn ChannelDriver>>,
    instance_id: Option<Uuid>,
}

impl SoftphoneBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: PhoneConfig::default(),
            stack: None,
            media: None,
            directory: None,
            monitor: None,
            auxiliary: None,
            instance_id: None,
        }
    }

    /// The SIP user agent to drive (required)
    pub fn stack(mut self, stack: Arc<dyn UserAgent>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// The platform media subsystem (required)
    pub fn media(mut self, media: Arc<dyn MediaBackend>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn config(mut self, config: PhoneConfig) -> Self {
        self.config = config;
        self
    }

    /// Directory used by `login` and for transfer targets
    pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn call_monitor(mut self, monitor: Arc<dyn CallMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Driver for an application-owned auxiliary connection (e.g. a presence socket)
    pub fn auxiliary_channel(mut self, driver: Arc<dyn ChannelDriver>) -> Self {
        self.auxiliary = Some(driver);
        self
    }

    /// Fixed device instance id; a random one is generated otherwise
    pub fn instance_id(mut self, id: Uuid) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Build the softphone and start its event dispatcher
    ///
    /// A stack and a media backend are required:
    ///
    /// ```rust
    /// # use rvoip_softphone_core::{Softphone, PhoneError};
    /// # tokio_test::block_on(async {
    /// let result = Softphone::builder().build().await;
    /// assert!(matches!(result, Err(PhoneError::MissingConfiguration { .. })));
    /// # })
    /// ```
    pub async fn build(self) -> PhoneResult<Arc<Softphone>> {
        let stack = self.stack.ok_or_else(|| PhoneError::missing_configuration("stack"))?;
        let media_backend = self.media.ok_or_else(|| PhoneError::missing_configuration("media"))?;
        if self.config.event_capacity == 0 {
            return Err(PhoneError::invalid_configuration(
                "event_capacity",
                "must be greater than zero",
            ));
        }

        let config = self.config;
        let events = EventBus::new(config.event_capacity);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecyclePhase::Idle);
        let resilience = ConnectionResilience::new(config.resilience.clone(), events.clone(), lifecycle_rx);
        let media = MediaBinder::new(
            media_backend,
            events.media.clone(),
            config.level_sample_interval,
            config.silent_sample_threshold,
        );
        let instance_id = self.instance_id.unwrap_or_else(Uuid::new_v4);

        let phone = Arc::new_cyclic(|weak| Softphone {
            reg: RegistrationCell::new(&config),
            config,
            stack: stack.clone(),
            media,
            events,
            resilience: resilience.clone(),
            directory: self.directory,
            monitor: self.monitor,
            lifecycle: lifecycle_tx,
            instance_id,
            calls: Mutex::new(CallTable::default()),
            transfer: Mutex::new(None),
            answer_waiters: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
            dispatcher: Mutex::new(None),
        });

        resilience.register_driver(
            Channel::Signaling,
            Arc::new(SignalingDriver {
                phone: Arc::downgrade(&phone),
            }),
        );
        if let Some(driver) = self.auxiliary {
            resilience.register_driver(Channel::Auxiliary, driver);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        phone.spawn_dispatcher(rx);
        stack.attach(tx);

        info!("Softphone built (instance {})", instance_id);
        Ok(phone)
    }
}

impl Default for SoftphoneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

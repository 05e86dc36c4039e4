//! Reconnection scheduler, health checks and heartbeats

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffPolicy, ReconnectState};
use super::{Channel, ConnectionState, Health, LifecyclePhase};
use crate::config::ResilienceConfig;
use crate::error::PhoneResult;
use crate::events::{ConnectionEvent, EventBus};

/// Brings one channel back and probes it
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Re-establish the channel
    async fn reconnect(&self) -> PhoneResult<()>;

    /// Is the channel usable right now
    async fn health_check(&self) -> bool;

    /// Send a keep-alive
    async fn heartbeat(&self) -> PhoneResult<()>;
}

/// Per-softphone connection resilience manager
pub struct ConnectionResilience {
    config: ResilienceConfig,
    policy: BackoffPolicy,
    events: EventBus,
    lifecycle: watch::Receiver<LifecyclePhase>,
    channels: DashMap<Channel, ConnectionState>,
    drivers: DashMap<Channel, Arc<dyn ChannelDriver>>,
    health_failures: DashMap<Channel, u32>,
    state: Mutex<ReconnectState>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
    enabled: AtomicBool,
    weak_self: Weak<ConnectionResilience>,
}

impl ConnectionResilience {
    pub fn new(
        config: ResilienceConfig,
        events: EventBus,
        lifecycle: watch::Receiver<LifecyclePhase>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            policy: BackoffPolicy::from_config(&config),
            config,
            events,
            lifecycle,
            channels: DashMap::new(),
            drivers: DashMap::new(),
            health_failures: DashMap::new(),
            state: Mutex::new(ReconnectState::default()),
            reconnect_task: Mutex::new(None),
            monitor_tasks: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Install the driver that reconnects and probes `channel`
    pub fn register_driver(&self, channel: Channel, driver: Arc<dyn ChannelDriver>) {
        self.drivers.insert(channel, driver);
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.lifecycle.borrow()
    }

    fn guarded(&self) -> bool {
        self.phase().suppresses_reconnect()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn channel_state(&self, channel: Channel) -> ConnectionState {
        self.channels
            .get(&channel)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.state.lock().clone()
    }

    /// Start watching: disconnects schedule reconnection and the periodic monitors run
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Connection resilience enabled");
        self.start_monitors();
    }

    /// Stop everything: pending reconnection, health checks and heartbeats
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);

        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        for task in self.monitor_tasks.lock().drain(..) {
            task.abort();
        }
        self.state.lock().reset();
        self.health_failures.clear();

        let tracked: Vec<Channel> = self.channels.iter().map(|e| *e.key()).collect();
        for channel in tracked {
            self.update_channel(channel, |s| {
                s.connected = false;
                s.health = Health::Unknown;
            });
        }
        debug!("Connection resilience stopped");
    }

    /// A channel came up; any success resets the backoff
    pub fn channel_connected(&self, channel: Channel) {
        self.health_failures.insert(channel, 0);
        self.update_channel(channel, |s| {
            s.connected = true;
            s.health = Health::Healthy;
            s.last_seen = Some(Utc::now());
        });

        let mut state = self.state.lock();
        if state.in_attempt {
            // run_attempt owns the bookkeeping while an attempt is executing
            return;
        }
        if state.is_reconnecting || state.attempts > 0 || state.exhausted {
            debug!(?channel, "Connection restored, resetting backoff");
            if let Some(task) = self.reconnect_task.lock().take() {
                task.abort();
            }
            state.reset();
        }
    }

    /// A channel went down; schedule reconnection
    pub fn channel_disconnected(&self, channel: Channel, reason: &str) {
        self.update_channel(channel, |s| {
            s.connected = false;
            s.health = Health::Unhealthy;
        });
        warn!(?channel, reason = reason, "Channel disconnected");
        self.schedule_reconnect(reason);
    }

    fn update_channel(&self, channel: Channel, apply: impl FnOnce(&mut ConnectionState)) {
        let (before, after) = {
            let mut entry = self.channels.entry(channel).or_default();
            let before = entry.value().clone();
            apply(entry.value_mut());
            (before, entry.value().clone())
        };
        if before.connected != after.connected || before.health != after.health {
            self.events.connection.emit(ConnectionEvent::StateChanged {
                channel,
                connected: after.connected,
                health: after.health,
            });
        }
    }

    /// Schedule the next reconnection attempt unless one is pending, we gave up, or the lifecycle guard is up
    pub fn schedule_reconnect(&self, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        if self.guarded() {
            debug!(phase = ?self.phase(), "Lifecycle guard active, not scheduling reconnection");
            return;
        }

        let (attempt, delay) = {
            let mut state = self.state.lock();
            if state.is_reconnecting || state.exhausted {
                return;
            }
            let attempt = state.attempts + 1;
            let delay = self.policy.delay_for(attempt);
            state.is_reconnecting = true;
            state.next_attempt_at = Some(Instant::now() + delay);
            (attempt, delay)
        };

        info!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            reason = reason,
            "Scheduling reconnection"
        );
        self.events
            .connection
            .emit(ConnectionEvent::ReconnectScheduled { attempt, delay });

        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.run_attempt().await;
            }
        });
        *self.reconnect_task.lock() = Some(task);
    }

    fn reconnect_targets(&self) -> Vec<(Channel, Arc<dyn ChannelDriver>)> {
        let mut targets: Vec<(Channel, Arc<dyn ChannelDriver>)> = Vec::new();
        for entry in self.channels.iter() {
            if entry.value().connected {
                continue;
            }
            let channel = entry.key().driver_channel();
            if targets.iter().any(|(c, _)| *c == channel) {
                continue;
            }
            if let Some(driver) = self.drivers.get(&channel) {
                targets.push((channel, driver.value().clone()));
            }
        }
        targets
    }

    async fn run_attempt(&self) {
        if !self.is_enabled() || self.guarded() {
            let mut state = self.state.lock();
            state.is_reconnecting = false;
            state.next_attempt_at = None;
            debug!(phase = ?self.phase(), "Reconnection attempt skipped");
            return;
        }

        let attempt = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.in_attempt = true;
            state.next_attempt_at = None;
            state.attempts
        };

        let targets = self.reconnect_targets();
        debug!(attempt = attempt, channels = targets.len(), "Running reconnection attempt");

        let mut success = targets.is_empty();
        for (channel, driver) in targets {
            match driver.reconnect().await {
                Ok(()) => {
                    info!(?channel, attempt = attempt, "Reconnected");
                    self.health_failures.insert(channel, 0);
                    self.update_channel(channel, |s| {
                        s.connected = true;
                        s.health = Health::Healthy;
                        s.last_seen = Some(Utc::now());
                    });
                    success = true;
                }
                Err(e) => {
                    warn!(
                        ?channel,
                        attempt = attempt,
                        error = %e,
                        category = e.category(),
                        "Reconnection attempt failed"
                    );
                }
            }
        }

        if success {
            self.state.lock().reset();
            self.events
                .connection
                .emit(ConnectionEvent::Reconnected { attempts: attempt });
            return;
        }

        let gave_up = {
            let mut state = self.state.lock();
            state.in_attempt = false;
            state.is_reconnecting = false;
            if state.attempts >= self.policy.max_attempts && !state.exhausted {
                state.exhausted = true;
                true
            } else {
                false
            }
        };

        if gave_up {
            error!(attempts = attempt, "Reconnection attempts exhausted");
            self.events
                .connection
                .emit(ConnectionEvent::MaxAttemptsReached { attempts: attempt });
        } else {
            self.schedule_reconnect("previous attempt failed");
        }
    }

    fn start_monitors(&self) {
        let mut tasks = self.monitor_tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let health_every = self.config.health_check_interval;
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + health_every, health_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.health_tick().await;
            }
        }));

        let heartbeat_every = self.config.heartbeat_interval;
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.heartbeat_tick().await;
            }
        }));

        // Leaving a guarded phase picks up channels that dropped meanwhile
        let mut lifecycle = self.lifecycle.clone();
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            while lifecycle.changed().await.is_ok() {
                let phase = *lifecycle.borrow_and_update();
                let Some(this) = weak.upgrade() else { break };
                if !phase.suppresses_reconnect() && !this.reconnect_targets().is_empty() {
                    this.schedule_reconnect("lifecycle guard lifted");
                }
            }
        }));
    }

    /// One round of health checks over connected channels
    pub async fn health_tick(&self) {
        if !self.is_enabled() || self.guarded() {
            return;
        }

        let drivers: Vec<(Channel, Arc<dyn ChannelDriver>)> = self
            .drivers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (channel, driver) in drivers {
            if !self.channel_state(channel).connected {
                continue;
            }
            if driver.health_check().await {
                self.health_failures.insert(channel, 0);
                self.update_channel(channel, |s| {
                    s.health = Health::Healthy;
                    s.last_seen = Some(Utc::now());
                });
                continue;
            }

            let failures = {
                let mut count = self.health_failures.entry(channel).or_insert(0);
                *count += 1;
                *count
            };
            warn!(?channel, failures = failures, "Health check failed");
            self.update_channel(channel, |s| s.health = Health::Unhealthy);

            if failures >= self.config.health_failure_threshold {
                self.health_failures.insert(channel, 0);
                self.channel_disconnected(channel, "health checks failing");
            }
        }
    }

    /// One round of heartbeats over connected channels
    pub async fn heartbeat_tick(&self) {
        if !self.is_enabled() || self.guarded() {
            return;
        }

        let drivers: Vec<(Channel, Arc<dyn ChannelDriver>)> = self
            .drivers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (channel, driver) in drivers {
            if !self.channel_state(channel).connected {
                continue;
            }
            match driver.heartbeat().await {
                Ok(()) => self.update_channel(channel, |s| s.last_seen = Some(Utc::now())),
                Err(e) => {
                    warn!(?channel, error = %e, "Heartbeat failed");
                    self.update_channel(channel, |s| s.health = Health::Unhealthy);
                }
            }
        }
    }
}

impl Drop for ConnectionResilience {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        for task in self.monitor_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

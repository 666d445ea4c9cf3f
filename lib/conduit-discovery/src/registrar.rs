//! Keeps this process registered in the discovery directory

use crate::directory::{DiscoveryDirectory, ServiceRegistration};
use conduit_core::{default_logger, CoreError, Logger, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Registration lifecycle. `Deregistered` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrarState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
    Deregistered,
}

impl fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrarState::Unregistered => "UNREGISTERED",
            RegistrarState::Registering => "REGISTERING",
            RegistrarState::Registered => "REGISTERED",
            RegistrarState::Deregistering => "DEREGISTERING",
            RegistrarState::Deregistered => "DEREGISTERED",
        };
        f.write_str(name)
    }
}

/// Handle on the periodic TTL renewal loop
pub struct RenewalTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    /// Renew `check_id` every `interval`, first tick one interval from now.
    /// Failures are reported and retried on the next tick.
    pub fn spawn(
        directory: Arc<dyn DiscoveryDirectory>,
        check_id: String,
        interval: Duration,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = directory.renew(&check_id).await {
                            let e = match e {
                                CoreError::RenewalFailed(_) => e,
                                other => CoreError::RenewalFailed(other.to_string()),
                            };
                            logger.error(&format!("warning: {}", e));
                        }
                    }
                }
            }
            debug!("Renewal loop for {} stopped", check_id);
        });
        Self { stop, handle }
    }

    /// Stop the loop and wait for it to exit. An in-flight renewal finishes
    /// first.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("Renewal task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Default)]
struct Inner {
    registration: Option<ServiceRegistration>,
    renewal: Option<RenewalTask>,
}

/// DiscoveryRegistrar registers the server, keeps its TTL check passing and
/// removes the registration on shutdown.
pub struct DiscoveryRegistrar {
    directory: Arc<dyn DiscoveryDirectory>,
    renew_interval: Duration,
    logger: Arc<dyn Logger>,
    inner: Mutex<Inner>,
    state: watch::Sender<RegistrarState>,
}

impl DiscoveryRegistrar {
    pub fn new(directory: Arc<dyn DiscoveryDirectory>, renew_interval: Duration) -> Self {
        let (state, _) = watch::channel(RegistrarState::Unregistered);
        Self {
            directory,
            renew_interval,
            logger: default_logger(),
            inner: Mutex::new(Inner::default()),
            state,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> RegistrarState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrarState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RegistrarState) {
        debug!("Registrar state -> {}", state);
        self.state.send_replace(state);
    }

    /// Register and start renewing. On failure the registrar goes back to
    /// `Unregistered`; the caller decides whether to keep serving.
    pub async fn register(&self, registration: ServiceRegistration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            RegistrarState::Unregistered => {}
            RegistrarState::Registered => {
                debug!("{} already registered", registration.service_id);
                return Ok(());
            }
            other => {
                return Err(CoreError::RegistrationFailed(format!(
                    "cannot register {} while {}",
                    registration.service_id, other
                )))
            }
        }

        self.set_state(RegistrarState::Registering);
        if let Err(e) = self.directory.register(&registration).await {
            self.set_state(RegistrarState::Unregistered);
            let e = match e {
                CoreError::RegistrationFailed(_) => e,
                other => CoreError::RegistrationFailed(other.to_string()),
            };
            return Err(e);
        }

        inner.renewal = Some(RenewalTask::spawn(
            self.directory.clone(),
            registration.check_id.clone(),
            self.renew_interval,
            self.logger.clone(),
        ));
        self.logger.info(&format!(
            "registered {} in discovery as {}, renewing every {:?}",
            registration.name, registration.service_id, self.renew_interval
        ));
        inner.registration = Some(registration);
        self.set_state(RegistrarState::Registered);
        Ok(())
    }

    /// Stop renewal and remove the registration. Safe to call any number of
    /// times; only the first call after a successful `register` reaches the
    /// directory.
    pub async fn deregister(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.state() != RegistrarState::Registered {
            return Ok(());
        }

        self.set_state(RegistrarState::Deregistering);
        if let Some(renewal) = inner.renewal.take() {
            renewal.stop().await;
        }

        let result = match inner.registration.take() {
            Some(reg) => {
                let result = self.directory.deregister(&reg.service_id, &reg.check_id).await;
                if result.is_ok() {
                    self.logger
                        .info(&format!("deregistered {} from discovery", reg.service_id));
                }
                result
            }
            None => Ok(()),
        };

        self.set_state(RegistrarState::Deregistered);
        result.map_err(|e| match e {
            CoreError::DeregistrationFailed(_) => e,
            other => CoreError::DeregistrationFailed(other.to_string()),
        })
    }
}

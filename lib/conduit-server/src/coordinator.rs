//! Server lifecycle: listeners, discovery presence and ordered shutdown

use crate::admin::{self, AdminEndpoint, AdminState};
use crate::handler::ConnectionHandler;
use crate::limiter::{AlwaysPass, Limiter};
use crate::listener::{accept_loop, aggregate_bind_errors, ListenerHandle, ListenerState};
use crate::signal::{wait_for_termination, TerminationSignal};
use conduit_client::MetricsCollector;
use conduit_core::config::ServerSettings;
use conduit_core::{default_logger, CoreError, Logger, Protocol, ResourcePool, Result};
use conduit_discovery::{DiscoveryRegistrar, ServiceRegistration};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Listening,
    Serving,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Init => "INIT",
            ServerState::Listening => "LISTENING",
            ServerState::Serving => "SERVING",
            ServerState::ShuttingDown => "SHUTTING_DOWN",
            ServerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// What started the shutdown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Signal(TerminationSignal),
    Explicit,
}

impl ShutdownTrigger {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownTrigger::Signal(signal) => signal.exit_code(),
            ShutdownTrigger::Explicit => 0,
        }
    }
}

/// Requests shutdown of a running coordinator from anywhere
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownTrigger>>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.trigger_with(ShutdownTrigger::Explicit);
    }

    /// Behave as if `trigger` had been received; the first request wins
    pub fn trigger_with(&self, trigger: ShutdownTrigger) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(trigger);
            true
        });
    }
}

/// ServerCoordinator brings up the listeners, keeps the discovery
/// registration alive and tears everything down in dependency order.
pub struct ServerCoordinator {
    settings: ServerSettings,
    logger: Arc<dyn Logger>,
    handlers: HashMap<Protocol, Arc<dyn ConnectionHandler>>,
    limiter: Arc<dyn Limiter>,
    registrar: Option<Arc<DiscoveryRegistrar>>,
    registration: Option<ServiceRegistration>,
    connection_caches: Vec<Arc<dyn ResourcePool>>,
    resource_pools: Vec<Arc<dyn ResourcePool>>,
    metrics: Option<MetricsCollector>,
    metrics_port: Option<u16>,
    profiling_port: Option<u16>,
    listeners: Vec<ListenerHandle>,
    accept_tasks: Vec<JoinHandle<()>>,
    admin_tasks: Vec<JoinHandle<()>>,
    stop_accepting: watch::Sender<bool>,
    state: watch::Sender<ServerState>,
    shutdown_tx: Arc<watch::Sender<Option<ShutdownTrigger>>>,
    shutdown_rx: watch::Receiver<Option<ShutdownTrigger>>,
}

impl ServerCoordinator {
    pub fn new(settings: ServerSettings) -> Self {
        let (stop_accepting, _) = watch::channel(false);
        let (state, _) = watch::channel(ServerState::Init);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        Self {
            settings,
            logger: default_logger(),
            handlers: HashMap::new(),
            limiter: Arc::new(AlwaysPass),
            registrar: None,
            registration: None,
            connection_caches: Vec::new(),
            resource_pools: Vec::new(),
            metrics: None,
            metrics_port: None,
            profiling_port: None,
            listeners: Vec::new(),
            accept_tasks: Vec::new(),
            admin_tasks: Vec::new(),
            stop_accepting,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Handler serving connections accepted on the `protocol` listener
    pub fn with_handler(mut self, protocol: Protocol, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handlers.insert(protocol, handler);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Register `registration` on start and deregister first on shutdown
    pub fn with_discovery(
        mut self,
        registrar: Arc<DiscoveryRegistrar>,
        registration: ServiceRegistration,
    ) -> Self {
        self.registrar = Some(registrar);
        self.registration = Some(registration);
        self
    }

    pub fn with_connection_caches(mut self, caches: Vec<Arc<dyn ResourcePool>>) -> Self {
        self.connection_caches.extend(caches);
        self
    }

    /// External pool (database, key-value store) closed last on shutdown
    pub fn with_resource_pool(mut self, pool: Arc<dyn ResourcePool>) -> Self {
        self.resource_pools.push(pool);
        self
    }

    /// Serve `/metrics` on `port` when it is non-zero
    pub fn with_metrics(mut self, metrics: MetricsCollector, port: u16) -> Self {
        self.metrics = Some(metrics);
        self.metrics_port = (port != 0).then_some(port);
        self
    }

    /// Serve `/debug/vars` on `port` when it is non-zero
    pub fn with_profiling(mut self, port: u16) -> Self {
        self.profiling_port = (port != 0).then_some(port);
        self
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    pub fn listener_state(&self, protocol: Protocol) -> Option<ListenerState> {
        self.listeners
            .iter()
            .find(|l| l.protocol == protocol)
            .map(|l| l.state)
    }

    pub fn bound_address(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.protocol == protocol)
            .and_then(|l| l.bound_address)
    }

    /// Bind failures of every requested listener
    pub fn bind_errors(&self) -> Vec<CoreError> {
        self.listeners.iter().filter_map(|l| l.error()).collect()
    }

    fn set_state(&self, state: ServerState) {
        debug!("Server state -> {}", state);
        self.state.send_replace(state);
    }

    /// Bind every requested listener independently
    pub async fn bind(&mut self) {
        if self.state() != ServerState::Init {
            return;
        }
        for protocol in [Protocol::Rpc, Protocol::Http] {
            let handle = ListenerHandle::bind(
                protocol,
                &self.settings.address,
                self.settings.port_for(protocol),
            )
            .await;
            if let Some(e) = handle.error() {
                self.logger.error(&e.to_string());
            }
            self.listeners.push(handle);
        }
        self.set_state(ServerState::Listening);
    }

    /// Start accepting, register in discovery and bring up the admin
    /// endpoints. Fails only when listeners were requested and none bound.
    pub async fn start(&mut self) -> Result<()> {
        self.bind().await;
        if self.state() != ServerState::Listening {
            return Err(CoreError::Internal(format!(
                "cannot start server in state {}",
                self.state()
            )));
        }

        let requested = self.listeners.iter().filter(|l| l.is_requested()).count();
        let bound = self
            .listeners
            .iter()
            .filter(|l| l.state == ListenerState::Bound)
            .count();
        if requested > 0 && bound == 0 {
            if let Some(e) = aggregate_bind_errors(self.bind_errors()) {
                return Err(e);
            }
        }

        for listener in self.listeners.iter_mut() {
            let handler = match self.handlers.get(&listener.protocol) {
                Some(handler) => handler.clone(),
                None => continue,
            };
            let Some(socket) = listener.take_socket() else {
                continue;
            };
            self.accept_tasks.push(tokio::spawn(accept_loop(
                socket,
                listener.protocol,
                handler,
                self.limiter.clone(),
                self.metrics.clone(),
                self.stop_accepting.subscribe(),
            )));
        }
        for listener in &self.listeners {
            if listener.state == ListenerState::Bound {
                warn!("{} listener bound but no handler is configured", listener.protocol);
            }
        }

        if let (Some(registrar), Some(registration)) = (&self.registrar, &self.registration) {
            if let Err(e) = registrar.register(registration.clone()).await {
                self.logger.error(&format!("warning: {}", e));
            }
        }

        self.spawn_admin();
        self.set_state(ServerState::Serving);
        self.logger.info(&format!(
            "{} serving with {} listener(s)",
            self.settings.service_name,
            self.accept_tasks.len()
        ));
        Ok(())
    }

    fn spawn_admin(&mut self) {
        let state = Arc::new(AdminState::new(
            self.settings.service_name.clone(),
            self.metrics.clone(),
        ));
        let endpoints = [
            (AdminEndpoint::Metrics, self.metrics_port),
            (AdminEndpoint::Profiling, self.profiling_port),
        ];
        for (endpoint, port) in endpoints {
            let Some(port) = port else {
                continue;
            };
            let host = self.settings.address.clone();
            let state = state.clone();
            let logger = self.logger.clone();
            self.admin_tasks.push(tokio::spawn(async move {
                if let Err(e) = admin::serve(endpoint, host, port, state).await {
                    logger.error(&format!("{:?} endpoint on port {} failed: {}", endpoint, port, e));
                }
            }));
        }
    }

    /// Wait until a termination signal arrives or shutdown is requested
    pub async fn wait_for_shutdown(&mut self) -> ShutdownTrigger {
        let first = tokio::select! {
            signal = wait_for_termination() => Ok(signal),
            trigger = Self::next_trigger(&mut self.shutdown_rx) => Err(trigger),
        };
        match first {
            Ok(Ok(signal)) => {
                info!("Received {}", signal);
                ShutdownTrigger::Signal(signal)
            }
            Ok(Err(e)) => {
                warn!("Cannot listen for termination signals: {}", e);
                Self::next_trigger(&mut self.shutdown_rx).await
            }
            Err(trigger) => trigger,
        }
    }

    async fn next_trigger(rx: &mut watch::Receiver<Option<ShutdownTrigger>>) -> ShutdownTrigger {
        loop {
            if let Some(trigger) = *rx.borrow_and_update() {
                return trigger;
            }
            if rx.changed().await.is_err() {
                return ShutdownTrigger::Explicit;
            }
        }
    }

    /// Run the shutdown sequence and return the exit status. Each step is
    /// best-effort: failures are logged and the next step still runs.
    pub async fn shutdown(&mut self, trigger: ShutdownTrigger) -> i32 {
        if matches!(self.state(), ServerState::ShuttingDown | ServerState::Stopped) {
            return trigger.exit_code();
        }
        self.set_state(ServerState::ShuttingDown);
        self.logger
            .info(&format!("{} shutting down ({:?})", self.settings.service_name, trigger));

        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.deregister().await {
                self.logger.error(&format!("warning: {}", e));
            }
        }

        let _ = self.stop_accepting.send(true);
        for task in self.accept_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        for task in self.admin_tasks.drain(..) {
            task.abort();
        }
        for listener in self.listeners.iter_mut() {
            listener.mark_stopped();
        }

        for cache in &self.connection_caches {
            if let Err(e) = cache.close().await {
                self.logger
                    .error(&format!("closing connection cache {} failed: {}", cache.name(), e));
            }
        }

        for pool in &self.resource_pools {
            match pool.close().await {
                Ok(()) => debug!("Closed resource pool {}", pool.name()),
                Err(e) => self
                    .logger
                    .error(&format!("closing resource pool {} failed: {}", pool.name(), e)),
            }
        }

        self.set_state(ServerState::Stopped);
        let code = trigger.exit_code();
        self.logger.info(&format!(
            "{} stopped, exit code {}",
            self.settings.service_name, code
        ));
        code
    }

    /// Start, serve until shutdown is requested, shut down. Returns the exit
    /// status.
    pub async fn run(mut self) -> Result<i32> {
        self.start().await?;
        let trigger = self.wait_for_shutdown().await;
        Ok(self.shutdown(trigger).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_discovery::DiscoveryDirectory;
    use std::sync::Mutex;
    use tokio::net::TcpStream;

    /// Records shutdown steps in order
    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: &str) {
            self.0.lock().unwrap().push(entry.to_string());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct JournalDirectory(Arc<Journal>);

    #[async_trait]
    impl DiscoveryDirectory for JournalDirectory {
        async fn register(&self, _registration: &ServiceRegistration) -> Result<()> {
            self.0.push("register");
            Ok(())
        }

        async fn deregister(&self, _service_id: &str, _check_id: &str) -> Result<()> {
            self.0.push("deregister");
            Ok(())
        }

        async fn renew(&self, _check_id: &str) -> Result<()> {
            Ok(())
        }

        async fn lookup(&self, _service_name: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct JournalPool {
        name: String,
        journal: Arc<Journal>,
        fail: bool,
    }

    #[async_trait]
    impl ResourcePool for JournalPool {
        fn name(&self) -> &str {
            &self.name
        }

        async fn close(&self) -> Result<()> {
            self.journal.push(&format!("close {}", self.name));
            if self.fail {
                Err(CoreError::Internal("pool already closed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct DropHandler;

    #[async_trait]
    impl ConnectionHandler for DropHandler {
        async fn handle(&self, _stream: TcpStream, _peer: SocketAddr) {}
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings(port: u16, http_port: u16) -> ServerSettings {
        ServerSettings {
            service_name: "echo".to_string(),
            address: "127.0.0.1".to_string(),
            port,
            http_port,
            advertise_address: Some("127.0.0.1".to_string()),
        }
    }

    fn pool(name: &str, journal: &Arc<Journal>, fail: bool) -> Arc<dyn ResourcePool> {
        Arc::new(JournalPool {
            name: name.to_string(),
            journal: journal.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_not_requested_listener_is_skipped() {
        let port = free_port().await;
        let mut coordinator = ServerCoordinator::new(settings(port, 0))
            .with_handler(Protocol::Rpc, Arc::new(DropHandler));
        coordinator.start().await.unwrap();

        assert_eq!(coordinator.state(), ServerState::Serving);
        assert_eq!(coordinator.listener_state(Protocol::Rpc), Some(ListenerState::Serving));
        assert_eq!(
            coordinator.listener_state(Protocol::Http),
            Some(ListenerState::NotRequested)
        );
        assert!(coordinator.bind_errors().is_empty());

        assert_eq!(coordinator.shutdown(ShutdownTrigger::Explicit).await, 0);
        assert_eq!(coordinator.state(), ServerState::Stopped);
        assert_eq!(coordinator.listener_state(Protocol::Rpc), Some(ListenerState::Stopped));
    }

    #[tokio::test]
    async fn test_one_failed_listener_does_not_stop_the_other() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let http_port = free_port().await;

        let mut coordinator = ServerCoordinator::new(settings(taken_port, http_port))
            .with_handler(Protocol::Rpc, Arc::new(DropHandler))
            .with_handler(Protocol::Http, Arc::new(DropHandler));
        coordinator.start().await.unwrap();

        assert_eq!(coordinator.listener_state(Protocol::Rpc), Some(ListenerState::Failed));
        assert_eq!(coordinator.listener_state(Protocol::Http), Some(ListenerState::Serving));
        assert_eq!(coordinator.bind_errors().len(), 1);

        let addr = coordinator.bound_address(Protocol::Http).unwrap();
        assert!(TcpStream::connect(addr).await.is_ok());
        coordinator.shutdown(ShutdownTrigger::Explicit).await;
    }

    #[tokio::test]
    async fn test_start_fails_when_no_listener_binds() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let mut coordinator = ServerCoordinator::new(settings(taken_port, 0));
        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ListenerBindFailed {
                protocol: Protocol::Rpc,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_runs_steps_in_order() {
        let journal = Arc::new(Journal::default());
        let registrar = Arc::new(DiscoveryRegistrar::new(
            Arc::new(JournalDirectory(journal.clone())),
            std::time::Duration::from_secs(10),
        ));
        let registration = ServiceRegistration::new(
            "echo",
            "127.0.0.1",
            9000,
            std::time::Duration::from_secs(30),
        );

        let port = free_port().await;
        let mut coordinator = ServerCoordinator::new(settings(port, 0))
            .with_handler(Protocol::Rpc, Arc::new(DropHandler))
            .with_discovery(registrar.clone(), registration)
            .with_connection_caches(vec![pool("rpc-cache", &journal, true)])
            .with_resource_pool(pool("mysql", &journal, true))
            .with_resource_pool(pool("redis", &journal, false));

        coordinator.start().await.unwrap();
        let code = coordinator
            .shutdown(ShutdownTrigger::Signal(TerminationSignal::Quit))
            .await;

        assert_eq!(code, 3);
        assert_eq!(
            journal.entries(),
            vec![
                "register",
                "deregister",
                "close rpc-cache",
                "close mysql",
                "close redis"
            ]
        );
        assert_eq!(coordinator.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_run_returns_trigger_exit_code() {
        let port = free_port().await;
        let coordinator = ServerCoordinator::new(settings(port, 0))
            .with_handler(Protocol::Rpc, Arc::new(DropHandler));
        let handle = coordinator.shutdown_handle();
        let mut states = coordinator.subscribe();

        let run = tokio::spawn(coordinator.run());
        while *states.borrow_and_update() != ServerState::Serving {
            states.changed().await.unwrap();
        }
        handle.trigger_with(ShutdownTrigger::Signal(TerminationSignal::Hangup));
        handle.trigger();

        assert_eq!(run.await.unwrap().unwrap(), 1);
    }
}

//! Tunnel Session
//!
//! Owns the engine lifecycle: at most one engine instance exists at a time,
//! and OS routing state is kept consistent with it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!            |
//!            +-- failure: completed steps undone in reverse -> Idle
//! ```
//!
//! Start and stop serialize on one async mutex held across every await,
//! OS route calls included. The observable state lives behind a separate
//! lock so it can be read while a transition is in flight.

use crate::engine::{EngineConfig, EngineError, EngineFactory, EngineSettings, TunnelEngine};
use crate::route::{NetworkInfo, RouteError, RoutePolicyManager};
use crate::validator::{NodeValidator, ValidateError, ValidatedNode};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl SessionState {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

/// Session errors; the underlying cause is shown unmodified
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already running with proxy {0:?}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Validate(#[from] ValidateError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Details of the running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub proxy: String,
    pub server_ip: Ipv4Addr,
    pub latency: Duration,
    /// Default network captured when routing was enabled
    pub network: Option<NetworkInfo>,
}

/// Everything a session needs
pub struct SessionComponents {
    pub validator: NodeValidator,
    pub engines: Arc<dyn EngineFactory>,
    pub engine_settings: EngineSettings,
    pub routes: RoutePolicyManager,
}

#[derive(Debug, Clone)]
struct Status {
    state: SessionState,
    active: Option<SessionInfo>,
}

enum Undo {
    CloseEngine,
    DisableForwarding(u32),
}

struct SessionInner {
    validator: NodeValidator,
    engines: Arc<dyn EngineFactory>,
    settings: EngineSettings,
    routes: RoutePolicyManager,
    engine: Option<Box<dyn TunnelEngine>>,
    /// Interface with forwarding enabled by this session
    forwarding: Option<u32>,
}

pub struct TunnelSession {
    inner: Mutex<SessionInner>,
    status: Arc<RwLock<Status>>,
}

impl TunnelSession {
    pub fn new(components: SessionComponents) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                validator: components.validator,
                engines: components.engines,
                settings: components.engine_settings,
                routes: components.routes,
                engine: None,
                forwarding: None,
            }),
            status: Arc::new(RwLock::new(Status {
                state: SessionState::Idle,
                active: None,
            })),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.status.read().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await.is_running()
    }

    pub async fn active_proxy(&self) -> Option<String> {
        self.status.read().await.active.as_ref().map(|a| a.proxy.clone())
    }

    pub async fn info(&self) -> Option<SessionInfo> {
        self.status.read().await.active.clone()
    }

    async fn set_status(&self, state: SessionState, active: Option<SessionInfo>) {
        let mut status = self.status.write().await;
        status.state = state;
        status.active = active;
    }

    /// Validate `proxy`, start the engine and, with `routing`, install the
    /// split-tunnel routes
    ///
    /// Starting the proxy that is already running is a no-op; a different
    /// proxy requires [`stop`](Self::stop) first.
    pub async fn start(&self, proxy: &str, routing: bool) -> Result<SessionInfo, SessionError> {
        let mut inner = self.inner.lock().await;

        if inner.engine.is_some() {
            let active = self.info().await;
            return match active {
                Some(info) if info.proxy == proxy => {
                    debug!("Session already running with {}", proxy);
                    Ok(info)
                }
                Some(info) => Err(SessionError::AlreadyRunning(info.proxy)),
                None => Err(SessionError::AlreadyRunning(String::new())),
            };
        }

        self.set_status(SessionState::Starting, None).await;
        info!("Starting session with {} (routing: {})", proxy, routing);

        match inner.start(proxy, routing).await {
            Ok(info) => {
                info!(
                    "Session running: {} ({}, {:?})",
                    info.proxy, info.server_ip, info.latency
                );
                self.set_status(SessionState::Running, Some(info.clone())).await;
                Ok(info)
            }
            Err(e) => {
                error!("Session start failed: {}", e);
                self.set_status(SessionState::Idle, None).await;
                Err(e)
            }
        }
    }

    /// Stop the engine and restore routing; safe to call at any time
    pub async fn stop(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        let Some(mut engine) = inner.engine.take() else {
            debug!("Stop requested with no running session");
            return Ok(());
        };

        let active = self.info().await;
        self.set_status(SessionState::Stopping, active).await;

        let mut first_error: Option<SessionError> = None;
        if let Err(e) = engine.close().await {
            warn!("Engine close failed: {}", e);
            first_error.get_or_insert(e.into());
        }
        drop(engine);

        if let Some(if_index) = inner.forwarding.take() {
            let table = inner.routes.table().clone();
            if let Err(e) = table.set_ip_forwarding(if_index, false).await {
                warn!("Disabling IP forwarding failed: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        if let Err(e) = inner.routes.remove().await {
            warn!("Route removal failed: {}", e);
            first_error.get_or_insert(e.into());
        }

        self.set_status(SessionState::Idle, None).await;
        info!("Session stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl SessionInner {
    async fn start(&mut self, proxy: &str, routing: bool) -> Result<SessionInfo, SessionError> {
        let validated = self.validator.validate(proxy).await?;

        let config = EngineConfig::new(
            validated.spec.clone(),
            self.settings.clone(),
            self.routes.rules(),
        );
        let mut engine = self.engines.create(config);
        engine.start().await?;
        let mut undo = vec![Undo::CloseEngine];

        let network = if routing {
            match self.apply_routing(&validated, &mut undo).await {
                Ok(network) => Some(network),
                Err(e) => {
                    self.rollback(engine.as_mut(), undo).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.engine = Some(engine);
        Ok(SessionInfo {
            proxy: validated.node.name,
            server_ip: validated.server_ip,
            latency: validated.latency,
            network,
        })
    }

    async fn apply_routing(
        &mut self,
        validated: &ValidatedNode,
        undo: &mut Vec<Undo>,
    ) -> Result<NetworkInfo, SessionError> {
        let table = self.routes.table().clone();
        let network = table.default_network().await?;

        table.set_ip_forwarding(network.if_index, true).await?;
        undo.push(Undo::DisableForwarding(network.if_index));

        // the proxy server itself must bypass the tunnel
        let server = Ipv4Net::from(validated.server_ip);
        self.routes.install(&[server]).await?;

        self.forwarding = Some(network.if_index);
        Ok(self.routes.snapshot().cloned().unwrap_or(network))
    }

    async fn rollback(&mut self, engine: &mut dyn TunnelEngine, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::CloseEngine => {
                    if let Err(e) = engine.close().await {
                        warn!("Rollback: engine close failed: {}", e);
                    }
                }
                Undo::DisableForwarding(if_index) => {
                    let table = self.routes.table().clone();
                    if let Err(e) = table.set_ip_forwarding(if_index, false).await {
                        warn!("Rollback: disabling forwarding failed: {}", e);
                    }
                }
            }
        }
    }
}

//! Collaborator capabilities consumed by the dispatcher.
//!
//! Discovery, provisioning and monitoring live outside this crate; the
//! dispatcher only sees them through these traits. [`ServiceRegistry`] and
//! [`ChannelSessionTracker`] are the in-process implementations used by
//! the binary and the tests.

use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::{ControlContext, DataContext, Deployment, ExecState, Exertion, ExertionId, Signature};
use crate::{Error, Result};

/// A callable service handle.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this service can execute `signature`.
    fn accepts(&self, signature: &Signature) -> bool;

    /// Execute `task` and return it with outputs written to its context.
    ///
    /// The returned status may be left RUNNING (the dispatcher marks it
    /// DONE) or set to SUSPENDED/FAILED by the service itself.
    async fn service(&self, task: Exertion) -> Result<Exertion>;
}

/// Resolves a signature to a service handle.
pub trait ServiceLocator: Send + Sync {
    fn resolve(&self, signature: &Signature) -> Option<Arc<dyn Service>>;
}

/// Deploys a service instance on demand.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, deployment: &Deployment) -> Result<Arc<dyn Service>>;
}

/// Receives state changes of monitorable exertions.
///
/// Monitoring is best effort: the dispatcher logs and drops every error.
pub trait SessionTracker: Send + Sync {
    fn init(&self, exertion: ExertionId, lease_period: Duration, timeout: Duration) -> Result<()>;

    fn changed(
        &self,
        exertion: ExertionId,
        context: &DataContext,
        control: &ControlContext,
        state: ExecState,
    ) -> Result<()>;

    /// Drop any lease held for `exertion`.
    fn release(&self, _exertion: ExertionId) -> Result<()> {
        Ok(())
    }
}

/// In-process service lookup.
///
/// Services are matched in registration order; a signature naming a
/// provider only matches a service with that name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<Vec<Arc<dyn Service>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn Service>) {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        services.push(service);
    }

    pub fn unregister(&self, name: &str) -> usize {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = services.len();
        services.retain(|s| s.name() != name);
        before - services.len()
    }

    pub fn len(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ServiceLocator for ServiceRegistry {
    fn resolve(&self, signature: &Signature) -> Option<Arc<dyn Service>> {
        let services = self
            .services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        services
            .iter()
            .filter(|s| match &signature.provider_name {
                Some(name) => s.name() == name,
                None => true,
            })
            .find(|s| s.accepts(signature))
            .cloned()
    }
}

/// Session notifications forwarded by [`ChannelSessionTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Init {
        exertion: ExertionId,
        lease_period: Duration,
    },
    Changed {
        exertion: ExertionId,
        state: ExecState,
        trace_len: usize,
    },
    Released {
        exertion: ExertionId,
    },
}

/// Forwards session notifications over a bounded channel without blocking.
///
/// A full channel drops the event and reports a monitor error, which the
/// dispatcher logs.
#[derive(Clone)]
pub struct ChannelSessionTracker {
    tx: Sender<SessionEvent>,
}

impl ChannelSessionTracker {
    pub fn new(tx: Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: SessionEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Monitor("session channel full".to_string())),
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Monitor("session channel closed".to_string()))
            }
        }
    }
}

impl SessionTracker for ChannelSessionTracker {
    fn init(&self, exertion: ExertionId, lease_period: Duration, _timeout: Duration) -> Result<()> {
        self.send(SessionEvent::Init {
            exertion,
            lease_period,
        })
    }

    fn changed(
        &self,
        exertion: ExertionId,
        _context: &DataContext,
        control: &ControlContext,
        state: ExecState,
    ) -> Result<()> {
        self.send(SessionEvent::Changed {
            exertion,
            state,
            trace_len: control.trace.len(),
        })
    }

    fn release(&self, exertion: ExertionId) -> Result<()> {
        self.send(SessionEvent::Released { exertion })
    }
}

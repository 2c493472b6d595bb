// src/signer/discovery.rs
//! Hardware-dongle discovery and session ownership.
//!
//! A [`SessionOwner`] holds the one live discovery subscription and the one
//! connected session. Starting a new discovery cancels the previous scan and
//! disconnects the previous session first.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::ledger::{DeviceSession, LedgerSigner};
use super::{DeviceError, SignerError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: String,
    pub model: String,
}

pub type DiscoveryStream = BoxStream<'static, Result<DiscoveredDevice, DeviceError>>;

/// Transport-level device management (USB/BLE).
#[async_trait]
pub trait DeviceManager: Send + Sync {
    type Session: DeviceSession + 'static;

    /// Long-lived scan. Dropping the stream stops it.
    fn start_discovering(&self) -> DiscoveryStream;

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Self::Session, DeviceError>;

    async fn disconnect(&self, session: &SessionId) -> Result<(), DeviceError>;
}

#[derive(Default)]
pub struct SessionOwner {
    discovery: Option<DiscoveryStream>,
    session: Option<SessionId>,
}

impl SessionOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_some()
    }
}

pub struct Discovery<M> {
    manager: M,
}

impl<M: DeviceManager> Discovery<M> {
    pub fn new(manager: M) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Cancels any running scan and disconnects any held session.
    pub async fn release(&self, owner: &mut SessionOwner) -> Result<(), SignerError> {
        if owner.discovery.take().is_some() {
            debug!("cancelled running device discovery");
        }
        if let Some(session) = owner.session.take() {
            info!("Disconnecting device session {}", session);
            self.manager.disconnect(&session).await?;
        }
        Ok(())
    }

    /// Connects to the first device found and hands its session to a signer.
    pub async fn discover_and_connect(
        &self,
        owner: &mut SessionOwner,
    ) -> Result<LedgerSigner<M::Session>, SignerError> {
        self.release(owner).await?;

        let found = owner.discovery.insert(self.manager.start_discovering()).next().await;
        owner.discovery = None;
        let device = match found {
            Some(Ok(device)) => device,
            Some(Err(cause)) => {
                warn!("device discovery failed: {}", cause);
                return Err(cause.into());
            }
            None => return Err(SignerError::NoDevice),
        };

        info!("Found {} ({}), connecting", device.model, device.id);
        let session = self.manager.connect(&device).await?;
        owner.session = Some(session.session_id().clone());
        Ok(LedgerSigner::new(session))
    }
}

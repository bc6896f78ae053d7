//! Thin client wrappers and a connection pool: the controller dials
//! many node agents and wants to reuse channels across a fan-out
//! rather than reconnect on every launch/signal/terminate.

use std::collections::HashMap;
use std::sync::Arc;

use cinder_common::error::{Error, ErrorKind, Result};
use cinder_pb::agent::agent_service_client::AgentServiceClient;
use cinder_pb::controller::controller_service_client::ControllerServiceClient;
use parking_lot::Mutex;
use tonic::transport::Channel;

#[derive(Clone)]
pub struct AgentClient {
    inner: AgentServiceClient<Channel>,
}

impl AgentClient {
    pub async fn connect(addr: String) -> Result<Self> {
        let channel = Channel::from_shared(addr.clone())
            .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid agent address", e))?
            .connect()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Unavailable, format!("connect to agent {addr}"), e))?;
        Ok(Self {
            inner: AgentServiceClient::new(channel),
        })
    }

    pub fn inner(&self) -> AgentServiceClient<Channel> {
        self.inner.clone()
    }
}

/// Caches one channel per node-agent address, keyed by host address.
/// Entries are never evicted here: the agent's lifetime equals the
/// node's and a controller's worth of agents is small.
#[derive(Default, Clone)]
pub struct AgentClientPool {
    inner: Arc<Mutex<HashMap<String, AgentClient>>>,
}

impl AgentClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, addr: &str) -> Result<AgentClient> {
        if let Some(c) = self.inner.lock().get(addr).cloned() {
            return Ok(c);
        }
        let client = AgentClient::connect(addr.to_string()).await?;
        self.inner.lock().insert(addr.to_string(), client.clone());
        Ok(client)
    }

    pub fn invalidate(&self, addr: &str) {
        self.inner.lock().remove(addr);
    }
}

pub type AgentClientPoolRef = Arc<AgentClientPool>;

#[derive(Clone)]
pub struct ControllerClient {
    inner: ControllerServiceClient<Channel>,
}

impl ControllerClient {
    pub async fn connect(addr: String) -> Result<Self> {
        let channel = Channel::from_shared(addr.clone())
            .map_err(|e| Error::with_source(ErrorKind::Validation, "invalid controller address", e))?
            .connect()
            .await
            .map_err(|e| {
                Error::with_source(ErrorKind::Unavailable, format!("connect to controller {addr}"), e)
            })?;
        Ok(Self {
            inner: ControllerServiceClient::new(channel),
        })
    }

    pub fn inner(&self) -> ControllerServiceClient<Channel> {
        self.inner.clone()
    }
}

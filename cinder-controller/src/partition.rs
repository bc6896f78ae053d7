//! Partition model (spec 4.2). Named policy over a subset of nodes;
//! mutable via admin RPC, owned by the controller alongside the node
//! registry.

use std::collections::{HashMap, HashSet};

use cinder_common::error::{Error, ErrorKind, Result};
use cinder_common::ids::NodeIndex;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharePolicy {
    Exclusive,
    No,
    Yes(u32),
    Force(u32),
}

impl SharePolicy {
    pub fn max_cotenants(&self) -> u32 {
        match self {
            SharePolicy::Exclusive | SharePolicy::No => 1,
            SharePolicy::Yes(n) | SharePolicy::Force(n) => *n,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s == "exclusive" {
            return Ok(SharePolicy::Exclusive);
        }
        if s == "no" {
            return Ok(SharePolicy::No);
        }
        if let Some(rest) = s.strip_prefix("yes:") {
            return rest
                .parse()
                .map(SharePolicy::Yes)
                .map_err(|_| Error::validation(format!("bad share policy {s}")));
        }
        if let Some(rest) = s.strip_prefix("force:") {
            return rest
                .parse()
                .map(SharePolicy::Force)
                .map_err(|_| Error::validation(format!("bad share policy {s}")));
        }
        Err(Error::validation(format!("unknown share policy {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Down,
    Drain,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct PartitionRecord {
    pub name: String,
    pub nodes: HashSet<NodeIndex>,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub max_time_secs: u64,
    pub priority: i32,
    pub share: SharePolicy,
    pub root_only: bool,
    pub hidden: bool,
    pub allowed_groups: Vec<String>,
    pub allowed_alloc_nodes: Vec<String>,
    pub availability: Availability,
    pub default: bool,
    pub features: Vec<String>,
}

impl PartitionRecord {
    pub fn is_usable(&self) -> bool {
        matches!(self.availability, Availability::Up)
    }

    pub fn group_allowed(&self, group: &str) -> bool {
        self.allowed_groups.is_empty() || self.allowed_groups.iter().any(|g| g == group)
    }
}

pub struct PartitionTable {
    inner: RwLock<HashMap<String, PartitionRecord>>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<PartitionRecord>) -> Self {
        let map = partitions.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self {
            inner: RwLock::new(map),
        }
    }

    pub async fn get(&self, name: &str) -> Result<PartitionRecord> {
        self.inner
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown partition {name}")))
    }

    pub async fn default_partition(&self) -> Result<PartitionRecord> {
        self.inner
            .read()
            .await
            .values()
            .find(|p| p.default)
            .cloned()
            .ok_or_else(|| Error::validation("no default partition configured"))
    }

    pub async fn list(&self) -> Vec<PartitionRecord> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn update_availability(&self, name: &str, availability: Availability) -> Result<()> {
        let mut inner = self.inner.write().await;
        let part = inner
            .get_mut(name)
            .ok_or_else(|| Error::validation(format!("unknown partition {name}")))?;
        part.availability = availability;
        Ok(())
    }
}

pub fn parse_availability(s: &str) -> Result<Availability> {
    Ok(match s {
        "up" => Availability::Up,
        "down" => Availability::Down,
        "drain" => Availability::Drain,
        "inactive" => Availability::Inactive,
        _ => {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("unknown partition availability {s}"),
            ))
        }
    })
}

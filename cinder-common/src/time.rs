//! Wall-clock helper shared by the agent and step shim. The controller
//! keeps its own copy colocated in `registry::now_unix` since that
//! crate doesn't depend on `cinder-common` for anything else
//! clock-related; this one exists so the agent and shim don't each
//! reinvent it.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

//! Client SIGINT relay (spec 4.7): the shim forwards a client's SIGINT
//! to the controller's `SignalStep`, which fans it out to every node
//! agent running the step. A second SIGINT arriving within
//! `escalate_secs` of the first escalates to `TerminateStep` instead,
//! matching the double-Ctrl-C convention spec 4.7 describes.

use std::sync::Arc;

use cinder_common::error::{Error, ErrorKind, Result};
use cinder_common::time::now_unix;
use cinder_pb::controller::{SignalStepRequest, TerminateStepRequest};
use cinder_rpc_client::ControllerClient;
use parking_lot::Mutex;

const SIGINT: i32 = 2;

pub struct SignalRelay {
    job_id: u64,
    step_id: u32,
    escalate_secs: i64,
    controller: ControllerClient,
    last_sigint_unix: Mutex<Option<i64>>,
}

impl SignalRelay {
    pub fn new(job_id: u64, step_id: u32, escalate_secs: u64, controller: ControllerClient) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            step_id,
            escalate_secs: escalate_secs as i64,
            controller,
            last_sigint_unix: Mutex::new(None),
        })
    }

    /// Called on every client-originated SIGINT. Escalates to a full
    /// step termination if the previous one arrived inside the
    /// escalation window; otherwise relays a plain `SIGINT`.
    pub async fn handle_sigint(&self) -> Result<()> {
        let now = now_unix();
        let escalate = {
            let mut last = self.last_sigint_unix.lock();
            let escalate = matches!(*last, Some(prev) if now - prev <= self.escalate_secs);
            *last = Some(now);
            escalate
        };
        let mut client = self.controller.inner();
        if escalate {
            let req = TerminateStepRequest {
                auth_token: String::new(),
                job_id: self.job_id,
                step_id: self.step_id,
            };
            client
                .terminate_step(req)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Unavailable, "relay terminate to controller failed", e))?;
        } else {
            let req = SignalStepRequest {
                auth_token: String::new(),
                job_id: self.job_id,
                step_id: self.step_id,
                signo: SIGINT,
            };
            client
                .signal_step(req)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Unavailable, "relay signal to controller failed", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sigint_within_window_escalates() {
        let last = Mutex::new(Some(now_unix()));
        let now = now_unix();
        let escalate_secs = 1i64;
        let escalate = matches!(*last.lock(), Some(prev) if now - prev <= escalate_secs);
        assert!(escalate);
    }
}

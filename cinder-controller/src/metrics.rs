//! Scheduler-facing Prometheus metrics, registered once per process on
//! the default registry that `rpc::server::serve` exposes at
//! `/metrics`.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts};

pub struct ControllerMetrics {
    pub scheduler_pass_duration: Histogram,
    pub scheduler_pass_commits: IntCounter,
    pub node_failure_jobs: IntCounter,
    pub node_state_transitions: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        let scheduler_pass_duration = Histogram::with_opts(HistogramOpts::new(
            "cinder_scheduler_pass_duration_seconds",
            "Wall-clock duration of one scheduler pass",
        ))
        .expect("valid histogram opts");
        let scheduler_pass_commits = IntCounter::new(
            "cinder_scheduler_pass_commits_total",
            "Allocations committed across all scheduler passes",
        )
        .expect("valid counter opts");
        let node_failure_jobs = IntCounter::new(
            "cinder_node_failure_jobs_total",
            "Jobs marked NODE_FAIL by the heartbeat sweeper",
        )
        .expect("valid counter opts");
        let node_state_transitions = IntCounterVec::new(
            Opts::new("cinder_node_state_transitions_total", "Node base-state transitions"),
            &["to"],
        )
        .expect("valid counter vec opts");

        // Registration against the default registry can fail with
        // AlreadyReg if a Controller/Scheduler is constructed more
        // than once in a process (integration tests do this); the
        // collectors themselves remain perfectly usable either way.
        let _ = prometheus::register(Box::new(scheduler_pass_duration.clone()));
        let _ = prometheus::register(Box::new(scheduler_pass_commits.clone()));
        let _ = prometheus::register(Box::new(node_failure_jobs.clone()));
        let _ = prometheus::register(Box::new(node_state_transitions.clone()));

        Self {
            scheduler_pass_duration,
            scheduler_pass_commits,
            node_failure_jobs,
            node_state_transitions,
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

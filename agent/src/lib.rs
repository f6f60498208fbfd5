//! Per-node execution agent for an HPC cluster.
//!
//! The agent is driven by the head-node scheduler over HTTP: it provisions
//! Linux users and SSH key material for incoming jobs, spawns and supervises
//! task processes under a control-group hierarchy, enforces cancellation with
//! a grace period, and reports completion by HTTP callback. Long-lived
//! reporters push node registration, heartbeat state and UDP metric packets
//! toward head-node endpoints resolved through the naming service.

pub mod cgroup;
pub mod executor;
pub mod hosts;
pub mod job_table;
pub mod monitor;
pub mod process;
pub mod trace;
pub mod users;

/// Exit code recorded on tasks terminated because their job ended.
pub const END_JOB_EXIT_CODE: i32 = -10002;
/// Exit code recorded on tasks terminated by an EndTask command.
pub const END_TASK_EXIT_CODE: i32 = -10003;

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Once;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

    /// Install a tracing subscriber for a test, once per process.
    pub(crate) fn install_test_trace_subscriber() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            Registry::default()
                .with(EnvFilter::from_default_env())
                .with(tracing_subscriber::fmt::layer().with_test_writer())
                .init()
        })
    }
}

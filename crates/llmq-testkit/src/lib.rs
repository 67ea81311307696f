//! LLMQ Testing Infrastructure
//!
//! Shared doubles for the collaborator traits and ready-made quorum
//! material, so crate tests do not each grow their own.
//!
//! ```toml
//! [dev-dependencies]
//! llmq-testkit = { path = "../llmq-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

/// Block index with reorgs
pub mod chain;

/// Dealt quorums
pub mod fixtures;

/// Masternode list
pub mod masternodes;

/// Network doubles
pub mod network;

pub use chain::MockChain;
pub use fixtures::QuorumFixture;
pub use masternodes::MockMasternodeList;
pub use network::{LoopbackMessenger, LoopbackNetwork, MisbehaviourReport, RecordingMessenger};

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

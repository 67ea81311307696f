//! Wiring of the whole quorum subsystem.
//!
//! `LlmqContext` owns one instance of every component and the tasks they
//! run. Construction order matters: the ledger is the DKG commitment sink,
//! and the quorum manager reads verified contributions from the DKG
//! manager.

use crate::ledger::CommitmentLedger;
use crate::manager::{QuorumManager, QuorumManagerDeps};
use llmq_core::{
    ActiveMasternode, BlockRef, ChainView, InterruptToken, LlmqConfig, LlmqError, MasternodeListProvider,
    MessageHandler, MessageKind, PeerId, PeerMessenger, QuorumMembers, Result, TaskRegistry,
};
use llmq_crypto::CryptoWorker;
use llmq_dkg::{DkgManagerDeps, DkgSessionManager};
use llmq_store::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often the quorum key caches are checked for rebuilding.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// The quorum subsystem of one node.
pub struct LlmqContext {
    config: LlmqConfig,
    worker: Arc<CryptoWorker>,
    ledger: Arc<CommitmentLedger>,
    dkg: Arc<DkgSessionManager>,
    quorums: Arc<QuorumManager>,
    tasks: TaskRegistry,
}

impl LlmqContext {
    /// Build every component. `local` is the node's masternode identity,
    /// if it runs one.
    pub fn new(
        config: LlmqConfig,
        chain: Arc<dyn ChainView>,
        mn_list: Arc<dyn MasternodeListProvider>,
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn KeyValueStore>,
        local: Option<ActiveMasternode>,
    ) -> Result<Self> {
        config.validate()?;
        let params = config.chainlock_params().cloned().ok_or_else(|| {
            LlmqError::invalid(format!("chainlock type {} has no parameter set", config.chainlock_type))
        })?;
        let interrupt = InterruptToken::new();
        let worker = Arc::new(CryptoWorker::from_config(&config)?);
        let members = Arc::new(QuorumMembers::new(mn_list));

        let ledger = Arc::new(CommitmentLedger::new(
            params,
            Arc::clone(&chain),
            Arc::clone(&members),
            Arc::clone(&messenger),
            Arc::clone(&store),
            config.flush_chunk_size,
        ));
        let local_pro_tx_hash = local.as_ref().map(|mn| mn.pro_tx_hash);
        let dkg = Arc::new(DkgSessionManager::new(
            &config,
            DkgManagerDeps {
                chain: Arc::clone(&chain),
                members: Arc::clone(&members),
                messenger: Arc::clone(&messenger),
                sink: ledger.clone(),
                worker: Arc::clone(&worker),
                store: Arc::clone(&store),
                local,
                interrupt: interrupt.clone(),
            },
        ));
        let quorums = Arc::new(QuorumManager::new(
            &config,
            QuorumManagerDeps {
                chain,
                members,
                ledger: Arc::clone(&ledger),
                dkg: Arc::clone(&dkg),
                worker: Arc::clone(&worker),
                messenger,
                store,
                local: local_pro_tx_hash,
                interrupt: interrupt.clone(),
            },
        )?);

        Ok(Self {
            config,
            worker,
            ledger,
            dkg,
            quorums,
            tasks: TaskRegistry::new(interrupt),
        })
    }

    /// Spawn the DKG phase tasks and periodic cache maintenance. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        self.dkg.start(&self.tasks);
        let quorums = Arc::clone(&self.quorums);
        self.tasks.spawn_interval_until(MAINTENANCE_INTERVAL, move || {
            let quorums = Arc::clone(&quorums);
            async move {
                if let Err(e) = quorums.do_maintenance() {
                    warn!(error = %e, "Quorum cache maintenance failed");
                }
                true
            }
        });
        info!(
            chainlock_type = %self.config.chainlock_type,
            quorum_types = self.config.params.len(),
            "Quorum subsystem started"
        );
    }

    /// Forward a new active tip to DKG and connection management.
    pub fn updated_block_tip(&self, tip: &BlockRef) {
        self.dkg.updated_block_tip(tip);
        self.quorums.updated_block_tip(tip);
    }

    /// Interrupt every task and wait for them to finish.
    pub async fn stop(&self) {
        self.tasks.shutdown().await;
        info!("Quorum subsystem stopped");
    }

    /// Persist mined commitments and the quorum key caches.
    pub fn flush(&self) -> Result<()> {
        self.ledger.flush_cache_to_disk()?;
        self.dkg.contribution_store().flush()?;
        self.quorums.flush_cache_to_disk()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &LlmqConfig {
        &self.config
    }

    /// Shared crypto worker.
    pub fn worker(&self) -> &Arc<CryptoWorker> {
        &self.worker
    }

    /// Commitment ledger.
    pub fn ledger(&self) -> &Arc<CommitmentLedger> {
        &self.ledger
    }

    /// DKG manager.
    pub fn dkg(&self) -> &Arc<DkgSessionManager> {
        &self.dkg
    }

    /// Quorum manager.
    pub fn quorums(&self) -> &Arc<QuorumManager> {
        &self.quorums
    }
}

impl MessageHandler for LlmqContext {
    fn process_message(&self, peer: PeerId, kind: MessageKind, payload: &[u8]) {
        match kind {
            MessageKind::FinalCommitment => self.ledger.process_message(peer, kind, payload),
            _ => self.dkg.process_message(peer, kind, payload),
        }
    }
}

impl std::fmt::Debug for LlmqContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmqContext")
            .field("chainlock_type", &self.config.chainlock_type)
            .field("dkg", &self.dkg)
            .field("quorums", &self.quorums)
            .finish_non_exhaustive()
    }
}

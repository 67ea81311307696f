//! Owner of all DKG handlers.
//!
//! One [`DkgSessionHandler`] per configured quorum type. The manager fans
//! chain tips out to them, routes inbound payloads by their leading quorum
//! type byte, and serves verified contributions to quorum building.

use crate::contributions::ContributionStore;
use crate::handler::{CommitmentSink, DkgSessionHandler, HandlerDeps};
use crate::session::SessionDeps;
use crate::simulation::{SimulatedErrorKind, SimulatedErrors};
use llmq_core::{
    ActiveMasternode, BitSet, BlockRef, ChainView, InterruptToken, LlmqConfig, LlmqType, MessageHandler,
    MessageKind, PeerId, PeerMessenger, QuorumMembers, SecretKey, TaskRegistry, VerificationVector,
};
use llmq_crypto::CryptoWorker;
use llmq_store::KeyValueStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Verified contributions of a quorum's valid members:
/// `(member indexes, vvecs, secret key contributions)`.
pub type VerifiedContributions = (Vec<usize>, Vec<VerificationVector>, Vec<SecretKey>);

/// Collaborators of the DKG subsystem.
#[derive(Clone)]
pub struct DkgManagerDeps {
    /// Block index
    pub chain: Arc<dyn ChainView>,
    /// Member derivation
    pub members: Arc<QuorumMembers>,
    /// Outbound network
    pub messenger: Arc<dyn PeerMessenger>,
    /// Destination of final commitments
    pub sink: Arc<dyn CommitmentSink>,
    /// Crypto offload
    pub worker: Arc<CryptoWorker>,
    /// Persistent storage
    pub store: Arc<dyn KeyValueStore>,
    /// Local masternode identity, if any
    pub local: Option<ActiveMasternode>,
    /// Shutdown signal
    pub interrupt: InterruptToken,
}

/// DKG handlers for every configured quorum type.
pub struct DkgSessionManager {
    handlers: BTreeMap<LlmqType, Arc<DkgSessionHandler>>,
    members: Arc<QuorumMembers>,
    contributions: Arc<ContributionStore>,
    simulated_errors: Arc<SimulatedErrors>,
}

impl DkgSessionManager {
    /// Build one handler per quorum type in `config`.
    pub fn new(config: &LlmqConfig, deps: DkgManagerDeps) -> Self {
        let contributions = Arc::new(ContributionStore::new(
            Arc::clone(&deps.store),
            config.flush_chunk_size,
        ));
        let simulated_errors = Arc::new(SimulatedErrors::new());
        let session = SessionDeps {
            worker: Arc::clone(&deps.worker),
            contributions: Arc::clone(&contributions),
            simulated_errors: Arc::clone(&simulated_errors),
        };
        let handler_deps = HandlerDeps {
            chain: deps.chain,
            members: Arc::clone(&deps.members),
            messenger: deps.messenger,
            sink: deps.sink,
            local: deps.local,
            session,
            interrupt: deps.interrupt,
        };

        let handlers = config
            .params
            .iter()
            .map(|params| {
                let handler = DkgSessionHandler::new(
                    params.clone(),
                    config.mine_on_demand,
                    config.target_spacing,
                    handler_deps.clone(),
                );
                (params.llmq_type, Arc::new(handler))
            })
            .collect();

        Self {
            handlers,
            members: deps.members,
            contributions,
            simulated_errors,
        }
    }

    /// Spawn one phase task per handler.
    pub fn start(&self, tasks: &TaskRegistry) {
        for handler in self.handlers.values() {
            tasks.spawn_cancellable(Arc::clone(handler).run());
        }
    }

    /// Forward a new chain tip to every handler.
    pub fn updated_block_tip(&self, tip: &BlockRef) {
        for handler in self.handlers.values() {
            handler.updated_block_tip(tip);
        }
    }

    /// Handler of `llmq_type`.
    pub fn handler(&self, llmq_type: LlmqType) -> Option<&Arc<DkgSessionHandler>> {
        self.handlers.get(&llmq_type)
    }

    /// Shared store of verified contributions.
    pub fn contribution_store(&self) -> &Arc<ContributionStore> {
        &self.contributions
    }

    /// Contributions of every member set in `valid_members`, or `None` if
    /// any of them is missing.
    pub fn get_verified_contributions(
        &self,
        llmq_type: LlmqType,
        quorum: &BlockRef,
        valid_members: &BitSet,
    ) -> Option<VerifiedContributions> {
        let params = self.handlers.get(&llmq_type)?.params();
        let members = self.members.members(params, quorum);

        let mut indexes = Vec::with_capacity(valid_members.count_ones());
        let mut vvecs = Vec::with_capacity(indexes.capacity());
        let mut sks = Vec::with_capacity(indexes.capacity());
        for idx in valid_members.iter_ones() {
            let Some(member) = members.get(idx) else {
                debug!(quorum_hash = %quorum.hash, idx, "Valid member index out of range");
                return None;
            };
            let read = self
                .contributions
                .read_vvec_contribution(llmq_type, quorum.hash, member.pro_tx_hash)
                .and_then(|vvec| {
                    let sk = self
                        .contributions
                        .read_sk_contribution(llmq_type, quorum.hash, member.pro_tx_hash)?;
                    Ok(vvec.zip(sk))
                });
            match read {
                Ok(Some((vvec, sk))) => {
                    indexes.push(idx);
                    vvecs.push(vvec);
                    sks.push(sk);
                }
                Ok(None) => {
                    debug!(quorum_hash = %quorum.hash, pro_tx_hash = %member.pro_tx_hash, "Missing verified contribution");
                    return None;
                }
                Err(e) => {
                    warn!(quorum_hash = %quorum.hash, error = %e, "Failed to read verified contribution");
                    return None;
                }
            }
        }
        Some((indexes, vvecs, sks))
    }

    /// Set the injection rate of `kind` for all sessions.
    pub fn set_simulated_error_rate(&self, kind: SimulatedErrorKind, rate: f64) {
        self.simulated_errors.set_simulated_error_rate(kind, rate);
    }

    /// Injection rate of `kind`.
    pub fn get_simulated_error_rate(&self, kind: SimulatedErrorKind) -> f64 {
        self.simulated_errors.get_simulated_error_rate(kind)
    }
}

impl MessageHandler for DkgSessionManager {
    fn process_message(&self, peer: PeerId, kind: MessageKind, payload: &[u8]) {
        if kind == MessageKind::FinalCommitment {
            return;
        }
        let Some(&type_byte) = payload.first() else {
            debug!(%peer, "Empty DKG message");
            return;
        };
        match self.handlers.get(&LlmqType(type_byte)) {
            Some(handler) => handler.process_message(peer, kind, payload),
            None => debug!(%peer, llmq_type = type_byte, "DKG message for unknown quorum type"),
        }
    }
}

impl std::fmt::Debug for DkgSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkgSessionManager")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

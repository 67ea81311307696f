//! Quorum type parameters and subsystem configuration.
//!
//! Parameters are plain serde structs so deployments can ship them as JSON
//! next to the rest of the chain parameters. The presets mirror the quorum
//! types used on mainnet, a mid-size type and a tiny regtest type.

use crate::{LlmqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Numeric quorum type identifier, as carried in DKG messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LlmqType(pub u8);

impl LlmqType {
    /// 50 members, 60% threshold
    pub const LLMQ_50_60: LlmqType = LlmqType(1);
    /// 400 members, 60% threshold
    pub const LLMQ_400_60: LlmqType = LlmqType(2);
    /// Regtest quorum
    pub const LLMQ_TEST: LlmqType = LlmqType(100);
}

impl fmt::Debug for LlmqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LlmqType({})", self.0)
    }
}

impl fmt::Display for LlmqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consensus parameters of one quorum type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmqParams {
    /// Type identifier
    pub llmq_type: LlmqType,
    /// Human readable name, used in logs
    pub name: String,
    /// Committee size
    pub size: usize,
    /// Minimum number of valid members (and signers) for a commitment
    pub min_size: usize,
    /// Signature shares needed to recover a quorum signature
    pub threshold: usize,
    /// Blocks between two DKG rounds
    pub dkg_interval: u32,
    /// Blocks per DKG phase
    pub dkg_phase_blocks: u32,
    /// First block offset (within the interval) at which commitments may be mined
    pub dkg_mining_window_start: u32,
    /// Last block offset at which commitments may be mined
    pub dkg_mining_window_end: u32,
    /// Complaints needed to mark a member bad
    pub dkg_bad_votes_threshold: usize,
    /// Quorums eligible for signing at any height
    pub signing_active_quorum_count: usize,
    /// Quorums for which connections are kept open
    pub keep_old_connections: usize,
}

impl LlmqParams {
    /// 50 member quorum with a 60% threshold.
    pub fn llmq_50_60() -> Self {
        Self {
            llmq_type: LlmqType::LLMQ_50_60,
            name: "llmq_50_60".into(),
            size: 50,
            min_size: 40,
            threshold: 30,
            dkg_interval: 24,
            dkg_phase_blocks: 2,
            dkg_mining_window_start: 10,
            dkg_mining_window_end: 18,
            dkg_bad_votes_threshold: 40,
            signing_active_quorum_count: 24,
            keep_old_connections: 25,
        }
    }

    /// 400 member quorum with a 60% threshold.
    pub fn llmq_400_60() -> Self {
        Self {
            llmq_type: LlmqType::LLMQ_400_60,
            name: "llmq_400_60".into(),
            size: 400,
            min_size: 300,
            threshold: 240,
            dkg_interval: 288,
            dkg_phase_blocks: 4,
            dkg_mining_window_start: 20,
            dkg_mining_window_end: 28,
            dkg_bad_votes_threshold: 300,
            signing_active_quorum_count: 4,
            keep_old_connections: 5,
        }
    }

    /// Small quorum for regtest and tests.
    pub fn llmq_test() -> Self {
        Self {
            llmq_type: LlmqType::LLMQ_TEST,
            name: "llmq_test".into(),
            size: 5,
            min_size: 3,
            threshold: 3,
            dkg_interval: 24,
            dkg_phase_blocks: 2,
            dkg_mining_window_start: 10,
            dkg_mining_window_end: 18,
            dkg_bad_votes_threshold: 3,
            signing_active_quorum_count: 2,
            keep_old_connections: 3,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.min_size == 0 || self.threshold == 0 {
            return Err(LlmqError::invalid(format!("{}: sizes must be non-zero", self.name)));
        }
        if self.min_size > self.size || self.threshold > self.min_size {
            return Err(LlmqError::invalid(format!(
                "{}: need threshold <= min_size <= size",
                self.name
            )));
        }
        if self.dkg_phase_blocks == 0 || self.dkg_interval < self.dkg_phase_blocks * 6 {
            return Err(LlmqError::invalid(format!(
                "{}: dkg_interval must fit all six phases",
                self.name
            )));
        }
        if self.dkg_mining_window_start > self.dkg_mining_window_end
            || self.dkg_mining_window_end >= self.dkg_interval
        {
            return Err(LlmqError::invalid(format!("{}: bad mining window", self.name)));
        }
        if self.signing_active_quorum_count == 0 {
            return Err(LlmqError::invalid(format!(
                "{}: signing_active_quorum_count must be non-zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Height of the DKG block of the interval containing `height`.
    pub fn quorum_height(&self, height: u32) -> u32 {
        height - height % self.dkg_interval
    }
}

/// Chain-lock specific knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLockParams {
    /// Coinbase chain-lock payloads are only validated at heights that are a
    /// multiple of this value. Zero disables the gate.
    pub coinbase_alignment: u32,
}

impl ChainLockParams {
    /// Half the DKG interval, rounded down to a multiple of five.
    pub fn for_params(params: &LlmqParams) -> Self {
        let half = params.dkg_interval / 2;
        Self {
            coinbase_alignment: (half - half % 5).max(1),
        }
    }

    /// Whether a coinbase chain-lock is checked at `height`.
    pub fn is_coinbase_chainlock_height(&self, height: u32) -> bool {
        self.coinbase_alignment != 0 && height % self.coinbase_alignment == 0
    }
}

/// Runtime configuration of the quorum subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmqConfig {
    /// Type whose commitments are mined and used for chain-locks and signing
    pub chainlock_type: LlmqType,
    /// All quorum types that run DKG
    pub params: Vec<LlmqParams>,
    /// Target block spacing, used to pace phase jitter
    #[serde(with = "duration_millis")]
    pub target_spacing: Duration,
    /// Blocks are produced on demand (regtest); disables pre-phase sleeps
    pub mine_on_demand: bool,
    /// Worker threads for crypto work; zero means "one per core"
    pub worker_threads: usize,
    /// FIFO bound of each persistent cache
    pub cache_bound: usize,
    /// Items per store batch when flushing caches
    pub flush_chunk_size: usize,
    /// Distance below the signing height at which quorums are selected
    pub sign_height_offset: u32,
    /// Chain-lock gating
    pub chainlock: ChainLockParams,
}

impl Default for LlmqConfig {
    fn default() -> Self {
        let params = LlmqParams::llmq_50_60();
        Self {
            chainlock_type: params.llmq_type,
            chainlock: ChainLockParams::for_params(&params),
            params: vec![params],
            target_spacing: Duration::from_secs(150),
            mine_on_demand: false,
            worker_threads: 0,
            cache_bound: 10,
            flush_chunk_size: 256,
            sign_height_offset: 5,
        }
    }
}

impl LlmqConfig {
    /// Regtest configuration built around [`LlmqParams::llmq_test`].
    pub fn regtest() -> Self {
        let params = LlmqParams::llmq_test();
        Self {
            chainlock_type: params.llmq_type,
            chainlock: ChainLockParams::for_params(&params),
            params: vec![params],
            target_spacing: Duration::from_millis(500),
            mine_on_demand: true,
            worker_threads: 2,
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check all parameter sets and cross references.
    pub fn validate(&self) -> Result<()> {
        for p in &self.params {
            p.validate()?;
        }
        if self.chainlock_params().is_none() {
            return Err(LlmqError::invalid(format!(
                "chainlock type {} has no parameter set",
                self.chainlock_type
            )));
        }
        if self.flush_chunk_size == 0 {
            return Err(LlmqError::invalid("flush_chunk_size must be non-zero"));
        }
        Ok(())
    }

    /// Parameters of `llmq_type`.
    pub fn params_for(&self, llmq_type: LlmqType) -> Option<&LlmqParams> {
        self.params.iter().find(|p| p.llmq_type == llmq_type)
    }

    /// Parameters of the chain-lock quorum type.
    pub fn chainlock_params(&self) -> Option<&LlmqParams> {
        self.params_for(self.chainlock_type)
    }

    /// Worker thread count with "auto" resolved.
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .max(1)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for p in [
            LlmqParams::llmq_50_60(),
            LlmqParams::llmq_400_60(),
            LlmqParams::llmq_test(),
        ] {
            p.validate().unwrap();
        }
    }

    #[test]
    fn test_threshold_above_min_size_rejected() {
        let mut p = LlmqParams::llmq_test();
        p.threshold = p.min_size + 1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_coinbase_alignment_rounds_to_five() {
        let p = LlmqParams::llmq_400_60();
        let cl = ChainLockParams::for_params(&p);
        assert_eq!(cl.coinbase_alignment, 140);
        assert!(cl.is_coinbase_chainlock_height(280));
        assert!(!cl.is_coinbase_chainlock_height(281));

        let cl = ChainLockParams::for_params(&LlmqParams::llmq_test());
        assert_eq!(cl.coinbase_alignment, 10);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "chainlock_type": 100,
            "params": [{
                "llmq_type": 100, "name": "llmq_test", "size": 5, "min_size": 3,
                "threshold": 3, "dkg_interval": 24, "dkg_phase_blocks": 2,
                "dkg_mining_window_start": 10, "dkg_mining_window_end": 18,
                "dkg_bad_votes_threshold": 3, "signing_active_quorum_count": 2,
                "keep_old_connections": 3
            }],
            "target_spacing": 1000,
            "mine_on_demand": true
        }"#;
        let config = LlmqConfig::from_json_str(json).unwrap();
        assert_eq!(config.target_spacing, Duration::from_secs(1));
        assert_eq!(config.sign_height_offset, 5);
        assert_eq!(config.chainlock_params().unwrap().size, 5);
    }

    #[test]
    fn test_config_without_chainlock_params_rejected() {
        let mut config = LlmqConfig::regtest();
        config.chainlock_type = LlmqType(42);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quorum_height() {
        let p = LlmqParams::llmq_test();
        assert_eq!(p.quorum_height(0), 0);
        assert_eq!(p.quorum_height(23), 0);
        assert_eq!(p.quorum_height(24), 24);
        assert_eq!(p.quorum_height(50), 48);
    }
}

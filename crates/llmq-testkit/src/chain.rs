//! In-memory block index with reorg support.

use llmq_core::{BlockRef, ChainView, Hash256, HashWriter};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct ChainState {
    parents: HashMap<Hash256, Option<Hash256>>,
    heights: HashMap<Hash256, u32>,
    active: Vec<Hash256>,
}

/// Deterministic chain. Block hashes depend on parent, height and a branch
/// salt, so forks produce distinct hashes at the same heights.
pub struct MockChain {
    state: RwLock<ChainState>,
}

impl MockChain {
    /// Chain holding only a genesis block at height 0.
    pub fn new() -> Self {
        let genesis = Hash256::sha256d(b"genesis");
        let mut state = ChainState::default();
        state.parents.insert(genesis, None);
        state.heights.insert(genesis, 0);
        state.active.push(genesis);
        Self {
            state: RwLock::new(state),
        }
    }

    fn block_hash(parent: &Hash256, height: u32, salt: u32) -> Hash256 {
        let mut w = HashWriter::new();
        w.write_hash(parent).write_u32(height).write_u32(salt);
        w.finish()
    }

    fn extend(state: &mut ChainState, salt: u32) -> BlockRef {
        let parent = *state.active.last().unwrap_or(&Hash256::ZERO);
        let height = state.active.len() as u32;
        let hash = Self::block_hash(&parent, height, salt);
        state.parents.insert(hash, Some(parent));
        state.heights.insert(hash, height);
        state.active.push(hash);
        BlockRef::new(hash, height)
    }

    /// Append one block to the active chain.
    pub fn mine_block(&self) -> BlockRef {
        Self::extend(&mut self.state.write(), 0)
    }

    /// Append `n` blocks and return the new tip.
    pub fn mine_blocks(&self, n: u32) -> BlockRef {
        let mut state = self.state.write();
        let mut tip = BlockRef::new(*state.active.last().unwrap_or(&Hash256::ZERO), state.active.len() as u32 - 1);
        for _ in 0..n {
            tip = Self::extend(&mut state, 0);
        }
        tip
    }

    /// Mine until the tip is at `height`.
    pub fn mine_to(&self, height: u32) -> BlockRef {
        let current = self.height();
        self.mine_blocks(height.saturating_sub(current))
    }

    /// Replace every block above `fork_height` with a branch of `len` new
    /// blocks. Old blocks stay indexed but leave the active chain.
    pub fn reorg(&self, fork_height: u32, len: u32, salt: u32) -> BlockRef {
        let mut state = self.state.write();
        state.active.truncate(fork_height as usize + 1);
        let mut tip = BlockRef::new(state.active[fork_height as usize], fork_height);
        for _ in 0..len {
            tip = Self::extend(&mut state, salt);
        }
        tip
    }

    /// Current tip height.
    pub fn height(&self) -> u32 {
        self.state.read().active.len() as u32 - 1
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainView for MockChain {
    fn tip(&self) -> Option<BlockRef> {
        let state = self.state.read();
        let hash = *state.active.last()?;
        Some(BlockRef::new(hash, state.active.len() as u32 - 1))
    }

    fn block_by_hash(&self, hash: &Hash256) -> Option<BlockRef> {
        let state = self.state.read();
        state.heights.get(hash).map(|h| BlockRef::new(*hash, *h))
    }

    fn ancestor(&self, block: &BlockRef, height: u32) -> Option<BlockRef> {
        if height > block.height {
            return None;
        }
        let state = self.state.read();
        let mut hash = block.hash;
        let mut current = *state.heights.get(&hash)?;
        while current > height {
            hash = (*state.parents.get(&hash)?)?;
            current -= 1;
        }
        Some(BlockRef::new(hash, current))
    }
}

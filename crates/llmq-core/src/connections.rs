//! Deterministic intra-quorum connection topology.
//!
//! Members relay to the ring neighbours at `(i + 2^k) % n`, giving every
//! member O(log n) outbound links while keeping the quorum connected.
//! For any pair, exactly one side is chosen to dial.

use crate::provider::Masternode;
use crate::{Hash256, HashWriter};
use std::collections::BTreeSet;

/// Which of the two members initiates the connection between them.
///
/// Picking `min(a, b)` would bias towards numerically low hashes, so both
/// candidates are scored by `sha256d(min || max || candidate)` instead.
pub fn deterministic_outbound_connection(a: &Hash256, b: &Hash256) -> Hash256 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let score = |x: &Hash256| {
        let mut w = HashWriter::new();
        w.write_hash(lo).write_hash(hi).write_hash(x);
        w.finish()
    };
    if score(a) < score(b) {
        *a
    } else {
        *b
    }
}

fn ring_outbound(members: &[Masternode], i: usize) -> BTreeSet<Hash256> {
    let n = members.len();
    let mut out = BTreeSet::new();
    if n <= 1 {
        return out;
    }
    let mut gap = 1usize;
    let mut gap_max = n - 1;
    let mut k = 0;
    loop {
        gap_max >>= 1;
        if gap_max == 0 && k > 1 {
            break;
        }
        let other = &members[(i + gap) % n];
        // Always advance, even when the slot is skipped
        gap <<= 1;
        k += 1;
        if other.pro_tx_hash != members[i].pro_tx_hash {
            out.insert(other.pro_tx_hash);
        }
    }
    out
}

/// Relay members of `for_member` within the ordered quorum `members`.
///
/// With `only_outbound`, only the members `for_member` dials; otherwise the
/// members dialing it are included as well.
pub fn quorum_relay_members(members: &[Masternode], for_member: &Hash256, only_outbound: bool) -> BTreeSet<Hash256> {
    let mut result = BTreeSet::new();
    for (i, mn) in members.iter().enumerate() {
        if &mn.pro_tx_hash == for_member {
            result.extend(ring_outbound(members, i));
        } else if !only_outbound && ring_outbound(members, i).contains(for_member) {
            result.insert(mn.pro_tx_hash);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::SecretKey;

    fn ring(n: u64) -> Vec<Masternode> {
        (1..=n)
            .map(|i| Masternode {
                pro_tx_hash: Hash256::sha256d(&i.to_le_bytes()),
                operator_key: SecretKey::from_u64(i).unwrap().public_key(),
            })
            .collect()
    }

    #[test]
    fn test_outbound_choice_is_symmetric() {
        let a = Hash256::sha256d(b"a");
        let b = Hash256::sha256d(b"b");
        let pick = deterministic_outbound_connection(&a, &b);
        assert_eq!(pick, deterministic_outbound_connection(&b, &a));
        assert!(pick == a || pick == b);
    }

    #[test]
    fn test_relay_members_of_ring() {
        let members = ring(10);
        let me = members[0].pro_tx_hash;
        let out = quorum_relay_members(&members, &me, true);
        // gaps 1, 2, 4 for n = 10
        let expected: BTreeSet<Hash256> = [1, 2, 4].iter().map(|i| members[*i].pro_tx_hash).collect();
        assert_eq!(out, expected);
        assert!(!out.contains(&me));

        let both = quorum_relay_members(&members, &me, false);
        assert!(both.is_superset(&out));
        // member 9 reaches 0 with gap 1
        assert!(both.contains(&members[9].pro_tx_hash));
    }

    #[test]
    fn test_single_member_has_no_relays() {
        let members = ring(1);
        assert!(quorum_relay_members(&members, &members[0].pro_tx_hash, false).is_empty());
    }
}

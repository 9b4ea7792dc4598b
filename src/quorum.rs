//! Quorum arithmetic for the CAC broadcast.
//!
//! All numeric thresholds of the broadcast live here so that a single module
//! fixes the protocol regime and tests can parameterise it. For a group of
//! `n` members and a concurrency parameter `k >= 1`:
//!
//! ```text
//! t   = (n - k) / 5        tolerated Byzantine members
//! q_w = 4t + k             witness quorum
//! q_r = n - t              ready quorum
//! ```
//!
//! The broadcast distinguishes the regimes `n > 3t + k` and `n > 5t + k`;
//! only in the latter can a uniquely witnessed message be delivered without
//! waiting for ready signatures.

/// The quorum thresholds of one CAC broadcast instance, fixed per epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuorumParams {
    /// The number of group members.
    pub n: usize,
    /// The concurrency parameter: up to `k` concurrent broadcasts are
    /// tolerated without a conflict.
    pub k: usize,
    /// The number of tolerated Byzantine members.
    pub t: usize,
    /// The number of witness signatures required to sign ready.
    pub q_witness: usize,
    /// The number of ready signatures required to deliver.
    pub q_ready: usize,
}

impl QuorumParams {
    /// Derives the thresholds for a group of `n` members.
    ///
    /// # Panics
    ///
    /// Panics if `k == 0` or `n < k`.
    pub fn new(n: usize, k: usize) -> Self {
        assert!(k >= 1, "The concurrency parameter must be at least 1.");
        assert!(n >= k, "The group must have at least k members.");
        let t = (n - k) / 5;
        QuorumParams {
            n,
            k,
            t,
            q_witness: 4 * t + k,
            q_ready: n - t,
        }
    }

    /// The witness count beyond which a message is guaranteed a majority
    /// among correct members.
    #[inline]
    pub fn witness_majority(&self) -> usize {
        (self.n + self.t) / 2 + 1
    }

    /// Returns `true` in the `n > 5t` regime, where a uniquely witnessed
    /// message may be delivered without a ready quorum.
    #[inline]
    pub fn immediate_regime(&self) -> bool {
        self.n > 5 * self.t
    }

    /// The number of distinct signing processes that must have been seen
    /// before the fallback witness rules engage.
    #[inline]
    pub fn seen_threshold(&self) -> usize {
        self.n - self.t
    }
}

#[cfg(test)]
mod tests {
    use super::QuorumParams;

    #[test]
    fn thresholds_match_the_intended_defaults() {
        let q = QuorumParams::new(4, 1);
        assert_eq!(q.t, 0);
        assert_eq!(q.q_witness, 1);
        assert_eq!(q.q_ready, 4);
        assert!(q.immediate_regime());

        let q = QuorumParams::new(16, 1);
        assert_eq!(q.t, 3);
        assert_eq!(q.q_witness, 13);
        assert_eq!(q.q_ready, 13);
        assert_eq!(q.witness_majority(), 10);
        assert!(q.immediate_regime());
    }

    #[test]
    fn quorums_intersect_in_correct_members() {
        for n in 1..60 {
            for k in 1..=n.min(3) {
                let q = QuorumParams::new(n, k);
                // Any two ready quorums share at least one correct member.
                assert!(2 * q.q_ready > q.n + q.t || q.t == 0);
                assert!(q.q_witness <= q.n);
            }
        }
    }
}

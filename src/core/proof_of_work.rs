use crate::core::BlockHeader;
use crate::error::{BlockchainError, Result};
use log::debug;
use num_bigint::BigUint;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

// What a single nonce attempt ended with
enum Search {
    Solved(u64),
    Stopped,
    Failed(BlockchainError),
}

/// Nonce search over a header template.
///
/// A header is valid when its double SHA-256, read as a big-endian
/// integer, is below `2^(256 - difficulty)`.
pub struct ProofOfWork {
    header: BlockHeader,
    target: BigUint,
}

impl ProofOfWork {
    pub fn new(header: BlockHeader) -> ProofOfWork {
        let target = Self::target(header.get_difficulty());
        ProofOfWork { header, target }
    }

    pub fn target(difficulty: u32) -> BigUint {
        BigUint::from(1u8) << (256 - difficulty.min(256) as usize)
    }

    pub fn meets_target(hash: &[u8], difficulty: u32) -> bool {
        BigUint::from_bytes_be(hash) < Self::target(difficulty)
    }

    /// Validate proof-of-work for a header
    pub fn validate(header: &BlockHeader) -> Result<bool> {
        Ok(Self::meets_target(
            &header.hash_bytes()?,
            header.get_difficulty(),
        ))
    }

    /// Searches nonces from `base` upwards on `workers` rayon threads.
    /// Returns the solved header, or `None` once `stop` returns true.
    ///
    /// `stop` is consulted every `poll_interval` nonces of each worker's
    /// share of the range.
    pub fn run(
        &self,
        workers: usize,
        base: u64,
        poll_interval: u64,
        stop: &(dyn Fn() -> bool + Sync),
    ) -> Result<Option<BlockHeader>> {
        let poll_interval = poll_interval.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .map_err(|e| BlockchainError::Mining(format!("Failed to start mining workers: {e}")))?;

        let outcome = pool.install(|| {
            (0u64..u64::MAX)
                .into_par_iter()
                .map_init(
                    || self.header.clone(),
                    |header, offset| {
                        if offset % poll_interval == 0 && stop() {
                            return Some(Search::Stopped);
                        }
                        let nonce = base.wrapping_add(offset);
                        header.set_nonce(nonce);
                        match header.hash_bytes() {
                            Ok(hash) if BigUint::from_bytes_be(&hash) < self.target => {
                                Some(Search::Solved(nonce))
                            }
                            Ok(_) => None,
                            Err(e) => Some(Search::Failed(e)),
                        }
                    },
                )
                .find_map_any(|step| step)
        });

        match outcome {
            Some(Search::Solved(nonce)) => {
                debug!(
                    "Found nonce {nonce} for block {} at difficulty {}",
                    self.header.get_index(),
                    self.header.get_difficulty()
                );
                let mut header = self.header.clone();
                header.set_nonce(nonce);
                Ok(Some(header))
            }
            Some(Search::Failed(e)) => Err(e),
            Some(Search::Stopped) | None => Ok(None),
        }
    }

    /// Single-threaded search that cannot be interrupted
    pub fn solve(&self) -> Result<BlockHeader> {
        self.run(1, 0, u64::MAX, &|| false)?.ok_or_else(|| {
            BlockchainError::Mining("Nonce space exhausted without a solution".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GENESIS_PREV_HASH;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn template(difficulty: u32) -> BlockHeader {
        BlockHeader::new(1, 1_000, GENESIS_PREV_HASH, difficulty, vec![7u8; 32])
    }

    #[test]
    fn test_higher_difficulty_means_smaller_target() {
        assert!(ProofOfWork::target(8) < ProofOfWork::target(4));
        assert_eq!(ProofOfWork::target(0), BigUint::from(1u8) << 256usize);
    }

    #[test]
    fn test_solved_header_validates() {
        let header = ProofOfWork::new(template(6)).solve().unwrap();
        assert!(ProofOfWork::validate(&header).unwrap());
        assert_eq!(header.get_difficulty(), 6);
    }

    #[test]
    fn test_parallel_workers_find_valid_nonce() {
        let pow = ProofOfWork::new(template(8));
        let header = pow.run(4, 12_345, 64, &|| false).unwrap().unwrap();
        assert!(ProofOfWork::validate(&header).unwrap());
    }

    #[test]
    fn test_stop_abandons_search() {
        // 200 leading zero bits will not be found in this test's lifetime
        let pow = ProofOfWork::new(template(200));
        let result = pow.run(2, 0, 16, &|| true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_stop_is_polled_while_searching() {
        let pow = ProofOfWork::new(template(200));
        let polls = AtomicUsize::new(0);
        let stop = || polls.fetch_add(1, Ordering::SeqCst) >= 3;

        assert!(pow.run(2, 99, 32, &stop).unwrap().is_none());
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_unsolved_header_fails_validation() {
        let mut header = template(200);
        header.set_nonce(1);
        assert!(!ProofOfWork::validate(&header).unwrap());
    }
}

use crate::core::Block;
use crate::error::{LedgerError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::{BigInt, Sign};
use rayon::prelude::*;
use std::ops::ShlAssign;

pub const DEFAULT_DIFFICULTY: u32 = 12;
const MAX_DIFFICULTY: u32 = 255;

/// How blocks get mined: the leading-zero-bit difficulty and the number of
/// search workers (1 keeps the search on the calling thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningConfig {
    pub difficulty: u32,
    pub workers: usize,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            difficulty: DEFAULT_DIFFICULTY,
            workers: 1,
        }
    }
}

impl MiningConfig {
    pub fn new(difficulty: u32, workers: usize) -> Result<MiningConfig> {
        check_difficulty(difficulty)?;
        Ok(MiningConfig {
            difficulty,
            workers: workers.max(1),
        })
    }
}

fn check_difficulty(difficulty: u32) -> Result<()> {
    if difficulty == 0 || difficulty > MAX_DIFFICULTY {
        return Err(LedgerError::InvalidDifficulty(difficulty));
    }
    Ok(())
}

/// Nonce search over a fixed `(prev_hash, merkle_root, difficulty)` candidate.
///
/// A hash is accepted when, read as a big-endian unsigned integer, it is
/// below `2^(256 - difficulty)`.
pub struct ProofOfWork {
    prev_hash: Vec<u8>,
    merkle_root: Vec<u8>,
    difficulty: u32,
    target: BigInt,
}

impl ProofOfWork {
    pub fn new(prev_hash: &[u8], merkle_root: &[u8], difficulty: u32) -> Result<ProofOfWork> {
        check_difficulty(difficulty)?;
        let mut target = BigInt::from(1);
        target.shl_assign(256 - difficulty);
        Ok(ProofOfWork {
            prev_hash: prev_hash.to_vec(),
            merkle_root: merkle_root.to_vec(),
            difficulty,
            target,
        })
    }

    pub fn from_block(block: &Block) -> Result<ProofOfWork> {
        let merkle_root = block.merkle_root()?;
        Self::new(block.get_pre_block_hash(), &merkle_root, block.get_difficulty())
    }

    pub fn target(&self) -> &BigInt {
        &self.target
    }

    /// Recomputes the block hash from its contents and checks it is both
    /// below target and equal to the stored hash. Used to audit the chain.
    pub fn validate(block: &Block) -> bool {
        let pow = match Self::from_block(block) {
            Ok(pow) => pow,
            Err(e) => {
                debug!("Cannot rebuild proof-of-work for block: {e}");
                return false;
            }
        };
        let hash = pow.hash_with_nonce(block.get_nonce());
        pow.meets_target(&hash) && hash == block.get_hash()
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.prev_hash.len() + self.merkle_root.len() + 12);
        data_bytes.extend(&self.prev_hash);
        data_bytes.extend(&self.merkle_root);
        data_bytes.extend(self.difficulty.to_be_bytes());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes
    }

    pub fn hash_with_nonce(&self, nonce: u64) -> Vec<u8> {
        sha256_digest(&self.prepare_data(nonce))
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigInt::from_bytes_be(Sign::Plus, hash) < self.target
    }

    /// Sequential search from nonce 0 until a hash meets the target.
    pub fn run(&self) -> Result<(u64, Vec<u8>)> {
        self.run_bounded(u64::MAX)
    }

    /// Sequential search over `0..max_nonce`.
    pub fn run_bounded(&self, max_nonce: u64) -> Result<(u64, Vec<u8>)> {
        debug!("Mining with difficulty {}", self.difficulty);
        for nonce in 0..max_nonce {
            let hash = self.hash_with_nonce(nonce);
            if self.meets_target(&hash) {
                debug!("Found nonce {nonce}: {}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }
        }
        Err(LedgerError::NonceExhausted)
    }

    /// Shards the nonce space over a rayon pool; the first worker to find a
    /// valid nonce wins. The winning nonce is re-checked before returning.
    pub fn run_parallel(&self, workers: usize) -> Result<(u64, Vec<u8>)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| LedgerError::Mining(format!("Failed to build mining pool: {e}")))?;

        let found = pool.install(|| {
            (0..u64::MAX)
                .into_par_iter()
                .find_any(|nonce| self.meets_target(&self.hash_with_nonce(*nonce)))
        });
        let nonce = found.ok_or(LedgerError::NonceExhausted)?;

        let hash = self.hash_with_nonce(nonce);
        if !self.meets_target(&hash) {
            return Err(LedgerError::Mining(format!(
                "Worker reported nonce {nonce} that does not meet the target"
            )));
        }
        info!("Parallel search on {workers} workers found nonce {nonce}");
        Ok((nonce, hash))
    }

    pub fn mine(&self, config: &MiningConfig) -> Result<(u64, Vec<u8>)> {
        if config.workers > 1 {
            self.run_parallel(config.workers)
        } else {
            self.run()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;

    fn create_test_block(difficulty: u32) -> Block {
        let coinbase_tx = Transaction::new_coinbase_tx(&[1u8; 20], "pow test").unwrap();
        let config = MiningConfig::new(difficulty, 1).unwrap();
        Block::new_block(vec![], &[coinbase_tx], &config).unwrap()
    }

    #[test]
    fn test_difficulty_bounds() {
        assert!(ProofOfWork::new(&[], &[0; 32], 0).is_err());
        assert!(ProofOfWork::new(&[], &[0; 32], 256).is_err());
        assert!(ProofOfWork::new(&[], &[0; 32], 255).is_ok());
        assert!(MiningConfig::new(0, 4).is_err());
    }

    #[test]
    fn test_higher_difficulty_has_smaller_target() {
        let easy = ProofOfWork::new(&[], &[0; 32], 4).unwrap();
        let hard = ProofOfWork::new(&[], &[0; 32], 8).unwrap();
        assert!(hard.target() < easy.target());
        assert!(easy.target() > &BigInt::from(0));
    }

    #[test]
    fn test_mined_block_validates() {
        let block = create_test_block(8);
        assert!(ProofOfWork::validate(&block));

        let hash = BigInt::from_bytes_be(Sign::Plus, block.get_hash());
        let pow = ProofOfWork::from_block(&block).unwrap();
        assert!(&hash < pow.target());
    }

    #[test]
    fn test_prepare_data_layout() {
        let pow = ProofOfWork::new(&[0xAA; 32], &[0xBB; 32], 6).unwrap();
        let data = pow.prepare_data(12345);
        assert_eq!(data.len(), 32 + 32 + 4 + 8);
        assert_eq!(&data[64..68], &6u32.to_be_bytes());
        assert_eq!(&data[68..], &12345u64.to_be_bytes());
        assert_ne!(pow.prepare_data(12345), pow.prepare_data(54321));
    }

    #[test]
    fn test_bounded_search_can_exhaust() {
        let pow = ProofOfWork::new(&[], &[0; 32], 255).unwrap();
        assert!(matches!(
            pow.run_bounded(16),
            Err(LedgerError::NonceExhausted)
        ));
    }

    #[test]
    fn test_parallel_search_meets_target() {
        let pow = ProofOfWork::new(&[3; 32], &[4; 32], 10).unwrap();
        let (nonce, hash) = pow.run_parallel(4).unwrap();
        assert_eq!(pow.hash_with_nonce(nonce), hash);
        assert!(pow.meets_target(&hash));
    }

    #[test]
    fn test_wrong_nonce_fails_validation() {
        let block = create_test_block(8);
        let tampered = block.with_nonce(block.get_nonce().wrapping_add(1));
        assert!(!ProofOfWork::validate(&tampered));
    }
}

use crate::core::{MerkleProof, MerkleTree, MiningConfig, ProofOfWork, Transaction};
use crate::error::{LedgerError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};

/// An immutable, mined batch of transactions linked to its predecessor.
///
/// `hash` is never chosen by the caller: it is the proof-of-work hash over
/// `prev_hash`, the Merkle root of `transactions`, `difficulty` and `nonce`.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    pre_block_hash: Vec<u8>,
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: u64,
    difficulty: u32,
}

impl Block {
    /// Builds and mines a block on top of `pre_block_hash`.
    pub fn new_block(
        pre_block_hash: Vec<u8>,
        transactions: &[Transaction],
        mining: &MiningConfig,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(LedgerError::EmptyBlock);
        }

        let merkle_root = Self::calculate_merkle_root(transactions)?;
        let pow = ProofOfWork::new(&pre_block_hash, &merkle_root, mining.difficulty)?;
        let (nonce, hash) = pow.mine(mining)?;
        info!(
            "Proof-of-work completed for block {} (difficulty: {}, nonce: {nonce})",
            HEXLOWER.encode(&hash),
            mining.difficulty
        );

        Ok(Block {
            pre_block_hash,
            hash,
            transactions: transactions.to_vec(),
            nonce,
            difficulty: mining.difficulty,
        })
    }

    pub fn generate_genesis_block(coinbase: &Transaction, mining: &MiningConfig) -> Result<Block> {
        Block::new_block(vec![], &[coinbase.clone()], mining)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    /// Merkle root over the content hash of every transaction, in block order.
    pub fn merkle_root(&self) -> Result<Vec<u8>> {
        Self::calculate_merkle_root(&self.transactions)
    }

    fn calculate_merkle_root(transactions: &[Transaction]) -> Result<Vec<u8>> {
        let leaf_hashes = transactions
            .iter()
            .map(Transaction::content_hash)
            .collect::<Result<Vec<_>>>()?;
        MerkleTree::compute_root(&leaf_hashes)
    }

    /// Inclusion proof for the transaction at `index`.
    pub fn merkle_proof(&self, index: usize) -> Result<MerkleProof> {
        let leaf_hashes = self
            .transactions
            .iter()
            .map(Transaction::content_hash)
            .collect::<Result<Vec<_>>>()?;
        MerkleTree::from_hashes(&leaf_hashes)?.generate_proof(index)
    }

    #[cfg(test)]
    pub(crate) fn with_nonce(&self, nonce: u64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_pre_block_hash(&self, pre_block_hash: Vec<u8>) -> Block {
        Block {
            pre_block_hash,
            ..self.clone()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_transactions(&self, transactions: Vec<Transaction>) -> Block {
        Block {
            transactions,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy() -> MiningConfig {
        MiningConfig::new(8, 1).unwrap()
    }

    fn coinbase(memo: &str) -> Transaction {
        Transaction::new_coinbase_tx(&[9u8; 20], memo).unwrap()
    }

    #[test]
    fn test_genesis_block_shape() {
        let genesis = Block::generate_genesis_block(&coinbase("genesis"), &easy()).unwrap();
        assert!(genesis.get_pre_block_hash().is_empty());
        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_transactions().len(), 1);
        assert!(genesis.get_transactions()[0].is_coinbase());
        assert!(ProofOfWork::validate(&genesis));
    }

    #[test]
    fn test_empty_block_rejected() {
        let result = Block::new_block(vec![1; 32], &[], &easy());
        assert!(matches!(result, Err(LedgerError::EmptyBlock)));
    }

    #[test]
    fn test_tampered_prev_hash_fails_validation() {
        let block = Block::new_block(vec![1; 32], &[coinbase("a")], &easy()).unwrap();
        let tampered = block.with_pre_block_hash(vec![2; 32]);
        assert!(!ProofOfWork::validate(&tampered));
    }

    #[test]
    fn test_tampered_transaction_value_fails_validation() {
        let block = Block::new_block(vec![1; 32], &[coinbase("a")], &easy()).unwrap();
        let mut forged = block.get_transactions()[0].clone();
        forged.set_output_value(0, 1_000_000);
        let tampered = block.with_transactions(vec![forged]);

        assert_ne!(tampered.merkle_root().unwrap(), block.merkle_root().unwrap());
        assert!(!ProofOfWork::validate(&tampered));
    }

    #[test]
    fn test_serialized_block_keeps_every_field() {
        let block =
            Block::new_block(vec![5; 32], &[coinbase("a"), coinbase("b")], &easy()).unwrap();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();

        assert_eq!(decoded.get_hash(), block.get_hash());
        assert_eq!(decoded.get_pre_block_hash(), block.get_pre_block_hash());
        assert_eq!(decoded.get_nonce(), block.get_nonce());
        assert_eq!(decoded.get_difficulty(), block.get_difficulty());
        assert_eq!(decoded.get_transactions().len(), 2);
        assert!(ProofOfWork::validate(&decoded));
    }

    #[test]
    fn test_merkle_proof_for_each_transaction() {
        let block = Block::new_block(
            vec![5; 32],
            &[coinbase("a"), coinbase("b"), coinbase("c")],
            &easy(),
        )
        .unwrap();
        for index in 0..3 {
            let proof = block.merkle_proof(index).unwrap();
            assert_eq!(proof.merkle_root, block.merkle_root().unwrap());
            assert!(proof.verify());
        }
    }
}

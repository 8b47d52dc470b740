//! Core ledger functionality
//!
//! Blocks, transactions, the Merkle commitment over a block's transactions,
//! proof-of-work mining and the append-only chain built from them.

pub mod block;
pub mod blockchain;
pub mod merkle;
pub mod monetary;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator, GENESIS_COINBASE_DATA};
pub use merkle::{MerkleProof, MerkleTree, ProofElement};
pub use monetary::BLOCK_SUBSIDY;
pub use proof_of_work::{MiningConfig, ProofOfWork, DEFAULT_DIFFICULTY};
pub use transaction::{TXInput, TXOutput, Transaction, COINBASE_VOUT};

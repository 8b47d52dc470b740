//! # utxo-ledger
//!
//! A single-node, append-only ledger of proof-of-work blocks holding
//! pay-to-pubkey-hash transactions.
//!
//! ## Layout
//! - `core/`: blocks, transactions, Merkle commitments, proof of work and the chain
//! - `storage/`: the `LedgerStore` capability, its sled and in-memory backends,
//!   and the UTXO cache
//! - `wallet/`: P-256 key pairs, Base58Check addresses and the wallet file
//! - `config/`: settings from defaults, TOML and the environment
//! - `utils/`: hashing, signatures and bincode helpers
//! - `cli/`: argument parsing for the binary
//!
//! Every block is stored under its own proof-of-work hash, so the chain can
//! only be extended at the tip and any edit to a stored block is detectable
//! with `Blockchain::validate_chain`.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod storage;
pub mod utils;
pub mod wallet;

pub use crate::cli::{Command, Opt};
pub use crate::config::Settings;
pub use crate::core::{
    Block, Blockchain, BlockchainIterator, MerkleProof, MerkleTree, MiningConfig, ProofOfWork,
    TXInput, TXOutput, Transaction, BLOCK_SUBSIDY, DEFAULT_DIFFICULTY,
};
pub use crate::error::{LedgerError, Result};
pub use crate::storage::{LedgerStore, MemoryStore, SledStore, UTXOSet, UnspentOutput};
pub use crate::utils::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};
pub use crate::wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};

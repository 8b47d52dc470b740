//! Ledger persistence
//!
//! The `LedgerStore` capability with its in-memory and sled backends, and
//! the UTXO cache derived from the chain.

pub mod sled_store;
pub mod store;
pub mod utxo_set;

pub use sled_store::SledStore;
pub use store::{
    BatchOp, Bucket, LedgerStore, MemoryStore, ReadHandle, WriteHandle, TIP_BLOCK_HASH_KEY,
};
pub use utxo_set::{UTXOSet, UnspentOutput};

use crate::core::Block;
use crate::error::{LedgerError, Result};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Reserved key in the blocks bucket holding the tip hash
pub const TIP_BLOCK_HASH_KEY: &[u8] = b"lh";

/// Named key spaces of the ledger store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// block hash -> serialized block, plus the tip pointer
    Blocks,
    /// txid -> serialized unspent outputs
    Chainstate,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Blocks => "blocks",
            Bucket::Chainstate => "chainstate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        bucket: Bucket,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: Bucket,
        key: Vec<u8>,
    },
    Clear(Bucket),
}

/// Durable key-value capability the ledger is built on.
///
/// `apply` must be atomic: either every operation of the batch becomes
/// visible or none does.
pub trait LedgerStore: Send + Sync {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry of `bucket` in key order.
    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply(&self, batch: Vec<BatchOp>) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// A ledger exists once a tip pointer has been written.
    fn exists(&self) -> Result<bool> {
        Ok(self.get(Bucket::Blocks, TIP_BLOCK_HASH_KEY)?.is_some())
    }
}

impl dyn LedgerStore {
    pub fn begin_read(&self) -> ReadHandle<'_> {
        ReadHandle { store: self }
    }

    pub fn begin_write(&self) -> WriteHandle<'_> {
        WriteHandle {
            store: self,
            cleared: BTreeSet::new(),
            pending: BTreeMap::new(),
            committed: false,
        }
    }
}

/// Read-only view of the store.
pub struct ReadHandle<'a> {
    store: &'a dyn LedgerStore,
}

impl ReadHandle<'_> {
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(bucket, key)
    }

    pub fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.store.scan(bucket)
    }

    pub fn tip_hash(&self) -> Result<Option<Vec<u8>>> {
        self.store.get(Bucket::Blocks, TIP_BLOCK_HASH_KEY)
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        self.store
            .get(Bucket::Blocks, hash)?
            .map(|bytes| Block::deserialize(&bytes))
            .transpose()
    }
}

/// Buffered read-write scope. Nothing reaches the store until `commit`;
/// dropping the handle uncommitted discards every buffered change.
pub struct WriteHandle<'a> {
    store: &'a dyn LedgerStore,
    cleared: BTreeSet<Bucket>,
    /// `None` marks a pending delete
    pending: BTreeMap<(Bucket, Vec<u8>), Option<Vec<u8>>>,
    committed: bool,
}

impl WriteHandle<'_> {
    /// Reads through the pending changes of this handle.
    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(&(bucket, key.to_vec())) {
            return Ok(value.clone());
        }
        if self.cleared.contains(&bucket) {
            return Ok(None);
        }
        self.store.get(bucket, key)
    }

    pub fn put(&mut self, bucket: Bucket, key: &[u8], value: Vec<u8>) {
        self.pending.insert((bucket, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, bucket: Bucket, key: &[u8]) {
        self.pending.insert((bucket, key.to_vec()), None);
    }

    pub fn clear(&mut self, bucket: Bucket) {
        self.pending.retain(|(pending_bucket, _), _| *pending_bucket != bucket);
        self.cleared.insert(bucket);
    }

    pub fn tip_hash(&self) -> Result<Option<Vec<u8>>> {
        self.get(Bucket::Blocks, TIP_BLOCK_HASH_KEY)
    }

    pub fn put_block(&mut self, block: &Block) -> Result<()> {
        let bytes = block.serialize()?;
        self.put(Bucket::Blocks, block.get_hash(), bytes);
        Ok(())
    }

    pub fn set_tip(&mut self, hash: &[u8]) {
        self.put(Bucket::Blocks, TIP_BLOCK_HASH_KEY, hash.to_vec());
    }

    pub fn commit(mut self) -> Result<()> {
        let mut batch: Vec<BatchOp> = self.cleared.iter().copied().map(BatchOp::Clear).collect();
        for ((bucket, key), value) in std::mem::take(&mut self.pending) {
            batch.push(match value {
                Some(value) => BatchOp::Put { bucket, key, value },
                None => BatchOp::Delete { bucket, key },
            });
        }
        debug!("Committing write batch with {} operations", batch.len());
        self.store.apply(batch)?;
        self.store.flush()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if !self.committed && (!self.pending.is_empty() || !self.cleared.is_empty()) {
            warn!(
                "Rolling back uncommitted write scope ({} pending changes)",
                self.pending.len()
            );
        }
    }
}

/// In-process store over ordered maps; every batch is applied under one
/// write lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl LedgerStore for MemoryStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerError::Database("Memory store lock poisoned".to_string()))?;
        Ok(inner.get(&bucket).and_then(|entries| entries.get(key).cloned()))
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerError::Database("Memory store lock poisoned".to_string()))?;
        Ok(inner
            .get(&bucket)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn apply(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LedgerError::Database("Memory store lock poisoned".to_string()))?;
        for op in batch {
            match op {
                BatchOp::Put { bucket, key, value } => {
                    inner.entry(bucket).or_default().insert(key, value);
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(entries) = inner.get_mut(&bucket) {
                        entries.remove(&key);
                    }
                }
                BatchOp::Clear(bucket) => {
                    inner.remove(&bucket);
                }
            }
        }
        Ok(())
    }
}

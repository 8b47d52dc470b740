use crate::error::{LedgerError, Result};
use crate::storage::{BatchOp, Bucket, LedgerStore};
use log::info;
use sled::transaction::{TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};

/// Durable ledger store on an embedded sled database, one tree per bucket.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    blocks: Tree,
    chainstate: Tree,
    db_path: PathBuf,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SledStore> {
        let db_path = path.as_ref().to_path_buf();
        let db = sled::open(&db_path)
            .map_err(|e| LedgerError::Database(format!("Failed to open database: {e}")))?;
        let blocks = Self::open_tree(&db, Bucket::Blocks)?;
        let chainstate = Self::open_tree(&db, Bucket::Chainstate)?;
        info!("Opened ledger store at {}", db_path.display());
        Ok(SledStore {
            db,
            blocks,
            chainstate,
            db_path,
        })
    }

    fn open_tree(db: &Db, bucket: Bucket) -> Result<Tree> {
        db.open_tree(bucket.name()).map_err(|e| {
            LedgerError::Database(format!("Failed to open {} tree: {e}", bucket.name()))
        })
    }

    pub fn get_db_path(&self) -> &Path {
        &self.db_path
    }

    fn tree(&self, bucket: Bucket) -> &Tree {
        match bucket {
            Bucket::Blocks => &self.blocks,
            Bucket::Chainstate => &self.chainstate,
        }
    }

    /// Sled transactions cannot clear a tree, so a clear becomes a delete of
    /// every key present when the batch is prepared.
    fn expand_clears(&self, batch: Vec<BatchOp>) -> Result<Vec<BatchOp>> {
        let mut expanded = Vec::with_capacity(batch.len());
        for op in batch {
            match op {
                BatchOp::Clear(bucket) => {
                    for key in self.tree(bucket).iter().keys() {
                        let key = key.map_err(|e| {
                            LedgerError::Database(format!(
                                "Failed to iterate {} tree: {e}",
                                bucket.name()
                            ))
                        })?;
                        expanded.push(BatchOp::Delete {
                            bucket,
                            key: key.to_vec(),
                        });
                    }
                }
                op => expanded.push(op),
            }
        }
        Ok(expanded)
    }
}

impl LedgerStore for SledStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.tree(bucket).get(key).map_err(|e| {
            LedgerError::Database(format!("Failed to read from {} tree: {e}", bucket.name()))
        })?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = vec![];
        for item in self.tree(bucket).iter() {
            let (k, v) = item.map_err(|e| {
                LedgerError::Database(format!("Failed to iterate {} tree: {e}", bucket.name()))
            })?;
            entries.push((k.to_vec(), v.to_vec()));
        }
        Ok(entries)
    }

    fn apply(&self, batch: Vec<BatchOp>) -> Result<()> {
        let ops = self.expand_clears(batch)?;

        (&self.blocks, &self.chainstate)
            .transaction(|(blocks_tx, chainstate_tx)| {
                for op in &ops {
                    let tree: &TransactionalTree = match op {
                        BatchOp::Put {
                            bucket: Bucket::Blocks,
                            ..
                        }
                        | BatchOp::Delete {
                            bucket: Bucket::Blocks,
                            ..
                        } => blocks_tx,
                        _ => chainstate_tx,
                    };
                    match op {
                        BatchOp::Put { key, value, .. } => {
                            tree.insert(key.as_slice(), value.as_slice())?;
                        }
                        BatchOp::Delete { key, .. } => {
                            tree.remove(key.as_slice())?;
                        }
                        BatchOp::Clear(_) => {}
                    }
                }
                Ok(())
            })
            .map_err(|e: TransactionError| {
                LedgerError::Database(format!("Failed to apply write batch: {e}"))
            })?;

        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| LedgerError::Database(format!("Failed to flush database: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_batch_spans_both_trees() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(SledStore::open(dir.path().join("db")).unwrap());

        let mut write = store.begin_write();
        write.put(Bucket::Blocks, b"block", b"bytes".to_vec());
        write.set_tip(b"block");
        write.put(Bucket::Chainstate, b"tx", b"outs".to_vec());
        write.commit().unwrap();

        assert!(store.exists().unwrap());
        assert_eq!(store.get(Bucket::Chainstate, b"tx").unwrap(), Some(b"outs".to_vec()));
        assert_eq!(store.begin_read().tip_hash().unwrap(), Some(b"block".to_vec()));
    }

    #[test]
    fn test_clear_only_touches_its_bucket() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(SledStore::open(dir.path().join("db")).unwrap());

        let mut write = store.begin_write();
        write.put(Bucket::Blocks, b"block", b"bytes".to_vec());
        write.put(Bucket::Chainstate, b"old", b"1".to_vec());
        write.commit().unwrap();

        let mut write = store.begin_write();
        write.clear(Bucket::Chainstate);
        write.put(Bucket::Chainstate, b"new", b"2".to_vec());
        write.commit().unwrap();

        assert_eq!(
            store.scan(Bucket::Chainstate).unwrap(),
            vec![(b"new".to_vec(), b"2".to_vec())]
        );
        assert!(store.get(Bucket::Blocks, b"block").unwrap().is_some());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let store: Arc<dyn LedgerStore> = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
            let mut write = store.begin_write();
            write.set_tip(b"tip");
            write.commit().unwrap();
        }
        let store = SledStore::open(dir.path().join("db")).unwrap();
        assert!(store.exists().unwrap());
    }
}

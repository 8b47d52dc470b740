// This is the chain itself, the part that decides what gets into my ledger.
// I keep every block in the store under its own hash, plus one tip pointer that
// names the newest block. Walking back from the tip through the previous hashes
// gets me all the way to genesis. I never rewrite a block, I only append, and an
// append writes the new block and moves the tip in the same batch.

use crate::core::transaction::collect_prev_transactions;
use crate::core::{Block, MiningConfig, ProofOfWork, Transaction, BLOCK_SUBSIDY};
use crate::error::{LedgerError, Result};
use crate::storage::{LedgerStore, UnspentOutput};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Memo carried by the genesis coinbase
pub const GENESIS_COINBASE_DATA: &str = "First Transaction from Genesis";

#[derive(Clone)]
pub struct Blockchain {
    store: Arc<dyn LedgerStore>,
    tip_hash: Arc<RwLock<Vec<u8>>>,
    // Serializes appends and UTXO cache writes so the tip and the cache
    // always move together.
    write_lock: Arc<Mutex<()>>,
    mining: MiningConfig,
}

impl Blockchain {
    /// Creates a new ledger whose genesis block pays the subsidy to
    /// `genesis_pub_key_hash`.
    pub fn initialize(
        store: Arc<dyn LedgerStore>,
        genesis_pub_key_hash: &[u8],
        mining: MiningConfig,
    ) -> Result<Blockchain> {
        if store.exists()? {
            return Err(LedgerError::AlreadyInitialized);
        }

        info!(
            "Creating genesis block for {}",
            HEXLOWER.encode(genesis_pub_key_hash)
        );
        // When I create a brand new ledger, the first block just pays the subsidy
        // to whoever asked for it
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_pub_key_hash, GENESIS_COINBASE_DATA)?;
        let genesis = Block::generate_genesis_block(&coinbase_tx, &mining)?;

        // Block and tip go in together, so a crash can't leave a tip without its block
        let mut write = store.begin_write();
        write.put_block(&genesis)?;
        write.set_tip(genesis.get_hash());
        write.commit()?;

        Ok(Blockchain {
            store,
            tip_hash: Arc::new(RwLock::new(genesis.get_hash().to_vec())),
            write_lock: Arc::new(Mutex::new(())),
            mining,
        })
    }

    /// Opens a ledger that was initialized earlier.
    pub fn resume(store: Arc<dyn LedgerStore>, mining: MiningConfig) -> Result<Blockchain> {
        // Whatever the tip pointer names is where I pick up again
        let tip_hash = store
            .begin_read()
            .tip_hash()?
            .ok_or(LedgerError::NotInitialized)?;
        debug!("Resumed ledger at tip {}", HEXLOWER.encode(&tip_hash));

        Ok(Blockchain {
            store,
            tip_hash: Arc::new(RwLock::new(tip_hash)),
            write_lock: Arc::new(Mutex::new(())),
            mining,
        })
    }

    pub fn get_store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn get_mining_config(&self) -> &MiningConfig {
        &self.mining
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.tip_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_tip_hash(&self, new_tip_hash: &[u8]) {
        let mut tip_hash = self
            .tip_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *tip_hash = new_tip_hash.to_vec();
    }

    pub(crate) fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| LedgerError::Database("Ledger write lock poisoned".to_string()))
    }

    /// Validates `transactions`, mines them into a block on the current tip
    /// and makes that block the new tip. The UTXO cache is left untouched.
    pub fn add_block(&self, transactions: &[Transaction]) -> Result<Block> {
        let _guard = self.lock_writes()?;
        self.append_block_locked(transactions)
    }

    /// Append body; the caller holds the write lock.
    pub(crate) fn append_block_locked(&self, transactions: &[Transaction]) -> Result<Block> {
        if transactions.is_empty() {
            return Err(LedgerError::EmptyBlock);
        }
        // Cheap checks on the batch alone come first
        Self::check_coinbase(transactions)?;
        Self::check_for_duplicate_ids(transactions)?;
        Self::check_for_double_spending(transactions)?;

        // Then I compare against everything already in the chain
        let (known_txids, spent) = self.scan_chain()?;
        for (i, tx) in transactions.iter().enumerate() {
            if known_txids.contains(tx.get_id()) {
                warn!("Rejecting batch: transaction {} is already in the chain", tx.get_id_hex());
                return Err(LedgerError::DuplicateTransaction(tx.get_id_hex()));
            }
            if tx.is_coinbase() {
                continue;
            }
            if let Some(input) = tx
                .get_vin()
                .iter()
                .find(|input| spent.contains(&(input.get_txid().to_vec(), input.get_vout())))
            {
                return Err(LedgerError::DoubleSpend {
                    txid: HEXLOWER.encode(input.get_txid()),
                    index: input.get_vout(),
                });
            }
            if !self.verify_transaction(tx)? {
                warn!("Rejecting batch: transaction {} failed verification", tx.get_id_hex());
                return Err(LedgerError::InvalidTransaction(format!(
                    "Transaction {i} ({}) failed verification",
                    tx.get_id_hex()
                )));
            }
        }

        let tip_hash = self
            .store
            .begin_read()
            .tip_hash()?
            .ok_or(LedgerError::NotInitialized)?;
        info!(
            "Mining block on {} with {} transactions (difficulty: {})",
            HEXLOWER.encode(&tip_hash),
            transactions.len(),
            self.mining.difficulty
        );
        // This is the slow part: grinding nonces until the hash is below target
        let block = Block::new_block(tip_hash, transactions, &self.mining)?;

        let mut write = self.store.begin_write();
        write.put_block(&block)?;
        write.set_tip(block.get_hash());
        write.commit()?;
        self.set_tip_hash(block.get_hash());

        info!("Successfully mined block: {}", block.get_hash_hex());
        Ok(block)
    }

    /// Rejects a batch in which two inputs name the same output.
    fn check_for_double_spending(transactions: &[Transaction]) -> Result<()> {
        let mut seen: HashSet<(&[u8], i64)> = HashSet::new();
        for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in tx.get_vin() {
                if !seen.insert((input.get_txid(), input.get_vout())) {
                    warn!(
                        "Output {}:{} spent twice in one batch",
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    );
                    return Err(LedgerError::DoubleSpend {
                        txid: HEXLOWER.encode(input.get_txid()),
                        index: input.get_vout(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A batch may carry at most one coinbase, and that coinbase mints
    /// exactly the block subsidy.
    fn check_coinbase(transactions: &[Transaction]) -> Result<()> {
        let coinbases: Vec<&Transaction> =
            transactions.iter().filter(|tx| tx.is_coinbase()).collect();
        if coinbases.len() > 1 {
            warn!("Rejecting batch with {} coinbase transactions", coinbases.len());
            return Err(LedgerError::InvalidCoinbase(format!(
                "Batch carries {} coinbase transactions, at most one is allowed",
                coinbases.len()
            )));
        }
        if let Some(coinbase) = coinbases.first() {
            if coinbase.get_output_value() != Some(BLOCK_SUBSIDY) {
                warn!("Rejecting coinbase {} with a wrong reward", coinbase.get_id_hex());
                return Err(LedgerError::InvalidCoinbase(format!(
                    "Coinbase {} must pay exactly {BLOCK_SUBSIDY}",
                    coinbase.get_id_hex()
                )));
            }
        }
        Ok(())
    }

    /// Rejects a batch that carries the same transaction id twice.
    fn check_for_duplicate_ids(transactions: &[Transaction]) -> Result<()> {
        let mut seen: HashSet<&[u8]> = HashSet::new();
        for tx in transactions {
            if !seen.insert(tx.get_id()) {
                warn!("Transaction {} appears twice in one batch", tx.get_id_hex());
                return Err(LedgerError::DuplicateTransaction(tx.get_id_hex()));
            }
        }
        Ok(())
    }

    /// One pass over the chain collecting every stored transaction id and
    /// every outpoint already consumed.
    fn scan_chain(&self) -> Result<(HashSet<Vec<u8>>, HashSet<(Vec<u8>, i64)>)> {
        let mut txids = HashSet::new();
        let mut spent = HashSet::new();
        for block in self.iterator() {
            for tx in block?.get_transactions() {
                txids.insert(tx.get_id().to_vec());
                if tx.is_coinbase() {
                    continue;
                }
                for input in tx.get_vin() {
                    spent.insert((input.get_txid().to_vec(), input.get_vout()));
                }
            }
        }
        Ok((txids, spent))
    }

    pub fn is_output_spent(&self, txid: &[u8], vout: i64) -> Result<bool> {
        let (_, spent) = self.scan_chain()?;
        Ok(spent.contains(&(txid.to_vec(), vout)))
    }

    pub fn iterator(&self) -> BlockchainIterator {
        BlockchainIterator {
            store: Arc::clone(&self.store),
            current_hash: Some(self.get_tip_hash()),
        }
    }

    /// Unspent outputs of the whole chain keyed by raw txid, computed by a
    /// backward scan. Spends always sit in later blocks than the outputs they
    /// consume, so they are seen first.
    pub fn find_utxo(&self) -> Result<HashMap<Vec<u8>, Vec<UnspentOutput>>> {
        let mut utxo: HashMap<Vec<u8>, Vec<UnspentOutput>> = HashMap::new();
        let mut spent_txos: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for block in self.iterator() {
            let block = block?;
            // Spends in this block first, so its own outputs are filtered right away
            for tx in block.get_transactions() {
                if tx.is_coinbase() {
                    continue;
                }
                for txin in tx.get_vin() {
                    spent_txos.insert((txin.get_txid().to_vec(), txin.get_vout()));
                }
            }

            for tx in block.get_transactions() {
                for (index, out) in tx.get_vout().iter().enumerate() {
                    if spent_txos.contains(&(tx.get_id().to_vec(), index as i64)) {
                        continue;
                    }
                    utxo.entry(tx.get_id().to_vec())
                        .or_default()
                        .push(UnspentOutput {
                            index,
                            output: out.clone(),
                        });
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iterator() {
            if let Some(tx) = block?
                .get_transactions()
                .iter()
                .find(|tx| tx.get_id() == txid)
            {
                return Ok(Some(tx.clone()));
            }
        }
        Ok(None)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        let prev_txs = collect_prev_transactions(self, tx)?;
        tx.sign(pkcs8, &prev_txs)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = collect_prev_transactions(self, tx)?;
        tx.verify(&prev_txs)
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Option<Block>> {
        self.store.begin_read().get_block(block_hash)
    }

    /// Number of blocks after genesis.
    pub fn get_best_height(&self) -> Result<usize> {
        let mut count = 0usize;
        for block in self.iterator() {
            block?;
            count += 1;
        }
        Ok(count.saturating_sub(1))
    }

    /// Walks the chain from the tip checking that every block is stored
    /// under its own hash, links to the next one and carries valid work.
    pub fn validate_chain(&self) -> Result<bool> {
        let mut expected = self.get_tip_hash();
        for block in self.iterator() {
            let block = block?;
            // A block has to sit under its own hash, the one its successor points to
            if block.get_hash() != expected.as_slice() {
                warn!(
                    "Block stored under {} reports hash {}",
                    HEXLOWER.encode(&expected),
                    block.get_hash_hex()
                );
                return Ok(false);
            }
            if !ProofOfWork::validate(&block) {
                warn!("Block {} has invalid proof of work", block.get_hash_hex());
                return Ok(false);
            }
            expected = block.get_pre_block_hash().to_vec();
        }
        Ok(true)
    }
}

/// Walks the chain from the tip back to genesis.
pub struct BlockchainIterator {
    store: Arc<dyn LedgerStore>,
    current_hash: Option<Vec<u8>>,
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;
        match self.store.begin_read().get_block(&hash) {
            Ok(Some(block)) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.get_pre_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Ok(None) => Some(Err(LedgerError::InvalidBlock(format!(
                "Block {} is referenced by the chain but missing from the store",
                HEXLOWER.encode(&hash)
            )))),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TXInput, TXOutput};
    use crate::storage::MemoryStore;
    use crate::wallet::Wallet;

    fn easy() -> MiningConfig {
        MiningConfig::new(8, 1).unwrap()
    }

    fn new_chain(owner: &Wallet) -> Blockchain {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        Blockchain::initialize(store, &owner.get_pub_key_hash(), easy()).unwrap()
    }

    fn spend(chain: &Blockchain, owner: &Wallet, from: &Transaction, to: &[u8]) -> Transaction {
        let value = from.get_vout()[0].get_value();
        let input = TXInput::new(from.get_id(), 0, owner.get_public_key());
        let mut tx = Transaction::new(vec![input], vec![TXOutput::new(value, to)]).unwrap();
        chain.sign_transaction(&mut tx, owner.get_pkcs8()).unwrap();
        tx
    }

    #[test]
    fn test_initialize_creates_genesis() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);

        let blocks: Vec<Block> = chain.iterator().collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert!(blocks[0].get_transactions()[0].get_vin()[0]
            .get_pub_key()
            .starts_with(GENESIS_COINBASE_DATA.as_bytes()));
        assert_eq!(chain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_initialize_twice_fails() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let again = Blockchain::initialize(
            Arc::clone(chain.get_store()),
            &owner.get_pub_key_hash(),
            easy(),
        );
        assert!(matches!(again, Err(LedgerError::AlreadyInitialized)));
    }

    #[test]
    fn test_resume_requires_existing_ledger() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        assert!(matches!(
            Blockchain::resume(store, easy()),
            Err(LedgerError::NotInitialized)
        ));
    }

    #[test]
    fn test_blocks_link_back_to_genesis() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        for memo in ["one", "two", "three"] {
            let reward = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), memo).unwrap();
            chain.add_block(&[reward]).unwrap();
        }

        let blocks: Vec<Block> = chain.iterator().collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].get_hash(), chain.get_tip_hash().as_slice());
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].get_pre_block_hash(), pair[1].get_hash());
        }
        assert!(chain.validate_chain().unwrap());
        assert_eq!(chain.get_best_height().unwrap(), 3);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        assert!(matches!(chain.add_block(&[]), Err(LedgerError::EmptyBlock)));
    }

    #[test]
    fn test_double_spend_in_batch_rejected() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let genesis_tx = chain.find_utxo().unwrap();
        let (txid, _) = genesis_tx.into_iter().next().unwrap();
        let funding = chain.find_transaction(&txid).unwrap().unwrap();

        let first = spend(&chain, &owner, &funding, &[1; 20]);
        let second = spend(&chain, &owner, &funding, &[2; 20]);
        let tip = chain.get_tip_hash();

        assert!(matches!(
            chain.add_block(&[first, second]),
            Err(LedgerError::DoubleSpend { index: 0, .. })
        ));
        assert_eq!(chain.get_tip_hash(), tip);
    }

    #[test]
    fn test_spent_output_cannot_be_reused() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let funding = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), "fund").unwrap();
        chain.add_block(&[funding.clone()]).unwrap();

        let first = spend(&chain, &owner, &funding, &[1; 20]);
        chain.add_block(&[first]).unwrap();
        assert!(chain.is_output_spent(funding.get_id(), 0).unwrap());

        let replay = spend(&chain, &owner, &funding, &[2; 20]);
        assert!(matches!(
            chain.add_block(&[replay]),
            Err(LedgerError::DoubleSpend { .. })
        ));
    }

    #[test]
    fn test_forged_signature_rejected() {
        let owner = Wallet::new().unwrap();
        let thief = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let funding = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), "fund").unwrap();
        chain.add_block(&[funding.clone()]).unwrap();

        let input = TXInput::new(funding.get_id(), 0, thief.get_public_key());
        let mut tx = Transaction::new(
            vec![input],
            vec![TXOutput::new(BLOCK_SUBSIDY, &thief.get_pub_key_hash())],
        )
        .unwrap();
        chain.sign_transaction(&mut tx, thief.get_pkcs8()).unwrap();

        assert!(matches!(
            chain.add_block(&[tx]),
            Err(LedgerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_transaction_already_in_chain_rejected() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let reward = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), "same").unwrap();
        chain.add_block(&[reward.clone()]).unwrap();
        let tip = chain.get_tip_hash();

        assert!(matches!(
            chain.add_block(&[reward]),
            Err(LedgerError::DuplicateTransaction(_))
        ));
        assert_eq!(chain.get_tip_hash(), tip);
    }

    #[test]
    fn test_transaction_repeated_in_batch_rejected() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let funding = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), "fund").unwrap();
        chain.add_block(&[funding.clone()]).unwrap();

        let moved = spend(&chain, &owner, &funding, &[3; 20]);
        assert!(matches!(
            chain.add_block(&[moved.clone(), moved]),
            Err(LedgerError::DuplicateTransaction(_))
        ));
        assert_eq!(chain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_second_coinbase_in_batch_rejected() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let key_hash = owner.get_pub_key_hash();
        let first = Transaction::new_coinbase_tx(&key_hash, "first").unwrap();
        let second = Transaction::new_coinbase_tx(&key_hash, "second").unwrap();

        assert!(matches!(
            chain.add_block(&[first, second]),
            Err(LedgerError::InvalidCoinbase(_))
        ));
        assert_eq!(chain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_coinbase_must_pay_block_subsidy() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let key_hash = owner.get_pub_key_hash();

        for reward in [1_000_000, BLOCK_SUBSIDY - 1, 0] {
            let coinbase =
                Transaction::new_coinbase_tx_with_reward(&key_hash, "mint", reward).unwrap();
            assert!(matches!(
                chain.add_block(&[coinbase]),
                Err(LedgerError::InvalidCoinbase(_))
            ));
        }
        assert_eq!(chain.get_best_height().unwrap(), 0);

        let coinbase = Transaction::new_coinbase_tx(&key_hash, "mint").unwrap();
        chain.add_block(&[coinbase]).unwrap();
        assert_eq!(chain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_find_utxo_tracks_spends() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let funding = Transaction::new_coinbase_tx(&owner.get_pub_key_hash(), "fund").unwrap();
        chain.add_block(&[funding.clone()]).unwrap();
        let moved = spend(&chain, &owner, &funding, &[7; 20]);
        chain.add_block(&[moved.clone()]).unwrap();

        let utxo = chain.find_utxo().unwrap();
        assert!(!utxo.contains_key(funding.get_id()));
        assert_eq!(utxo[moved.get_id()][0].index, 0);
        assert_eq!(utxo[moved.get_id()][0].output.get_pub_key_hash(), &[7; 20]);
    }

    #[test]
    fn test_find_transaction_unknown_id() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        assert!(chain.find_transaction(&[0; 32]).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_appends_form_one_chain() {
        let owner = Wallet::new().unwrap();
        let chain = new_chain(&owner);
        let key_hash = owner.get_pub_key_hash();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let chain = chain.clone();
                let key_hash = key_hash.clone();
                std::thread::spawn(move || {
                    let reward = Transaction::new_coinbase_tx(&key_hash, &format!("t{i}")).unwrap();
                    chain.add_block(&[reward]).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(chain.get_best_height().unwrap(), 4);
        assert!(chain.validate_chain().unwrap());
    }
}

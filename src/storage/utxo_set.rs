use crate::core::{Block, Blockchain, TXOutput, Transaction};
use crate::error::{LedgerError, Result};
use crate::storage::{Bucket, WriteHandle};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An output still waiting to be spent, with its position in the creating
/// transaction so later inputs can still reference it by index.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct UnspentOutput {
    pub index: usize,
    pub output: TXOutput,
}

/// Derived cache of unspent outputs, keyed by txid in the chainstate bucket.
///
/// `reindex` rebuilds it from a full chain scan; `update` folds in one newly
/// appended block and must run exactly once per block, in chain order.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    fn decode_entry(bytes: &[u8]) -> Result<Vec<UnspentOutput>> {
        deserialize(bytes).map_err(|e| {
            LedgerError::Serialization(format!("Failed to deserialize unspent outputs: {e}"))
        })
    }

    /// Every cached entry in key order.
    pub fn entries(&self) -> Result<BTreeMap<Vec<u8>, Vec<UnspentOutput>>> {
        let read = self.blockchain.get_store().begin_read();
        read.scan(Bucket::Chainstate)?
            .into_iter()
            .map(|(txid, bytes)| Ok((txid, Self::decode_entry(&bytes)?)))
            .collect()
    }

    /// Greedily collects outputs locked to `pub_key_hash` until `amount` is
    /// reached. An accumulated total below `amount` means insufficient funds.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0u64;

        'scan: for (txid, outs) in self.entries()? {
            let txid_hex = HEXLOWER.encode(&txid);
            for unspent in outs {
                if accumulated >= amount {
                    break 'scan;
                }
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(unspent.output.get_value());
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(unspent.index);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        Ok(self
            .entries()?
            .into_values()
            .flatten()
            .map(|unspent| unspent.output)
            .filter(|out| out.is_locked_with_key(pub_key_hash))
            .collect())
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .fold(0u64, u64::saturating_add))
    }

    /// Number of distinct transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<u64> {
        let read = self.blockchain.get_store().begin_read();
        Ok(read.scan(Bucket::Chainstate)?.len() as u64)
    }

    /// Drops the cache and rebuilds it from a full backward chain scan.
    pub fn reindex(&self) -> Result<()> {
        let _guard = self.blockchain.lock_writes()?;

        let utxo_map = self.blockchain.find_utxo()?;
        let mut write = self.blockchain.get_store().begin_write();
        write.clear(Bucket::Chainstate);
        for (txid, outs) in &utxo_map {
            write.put(Bucket::Chainstate, txid, serialize(outs)?);
        }
        write.commit()?;

        info!(
            "Reindexed UTXO set: {} transactions with unspent outputs",
            utxo_map.len()
        );
        Ok(())
    }

    /// Folds one newly appended block into the cache.
    pub fn update(&self, block: &Block) -> Result<()> {
        let _guard = self.blockchain.lock_writes()?;
        self.update_locked(block)
    }

    /// Mines `transactions` into a new block and folds it into the cache
    /// while holding the write lock across both steps.
    pub fn append_block(&self, transactions: &[Transaction]) -> Result<Block> {
        let _guard = self.blockchain.lock_writes()?;
        let block = self.blockchain.append_block_locked(transactions)?;
        self.update_locked(&block)?;
        Ok(block)
    }

    fn update_locked(&self, block: &Block) -> Result<()> {
        let mut write = self.blockchain.get_store().begin_write();

        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                for vin in tx.get_vin() {
                    Self::spend_output(&mut write, vin.get_txid(), vin.get_vout())?;
                }
            }

            let new_outputs: Vec<UnspentOutput> = tx
                .get_vout()
                .iter()
                .enumerate()
                .map(|(index, output)| UnspentOutput {
                    index,
                    output: output.clone(),
                })
                .collect();
            if !new_outputs.is_empty() {
                write.put(Bucket::Chainstate, tx.get_id(), serialize(&new_outputs)?);
            }
        }

        write.commit()
    }

    fn spend_output(write: &mut WriteHandle<'_>, txid: &[u8], vout: i64) -> Result<()> {
        let missing = || LedgerError::UtxoNotFound {
            txid: HEXLOWER.encode(txid),
            index: vout,
        };
        let bytes = write.get(Bucket::Chainstate, txid)?.ok_or_else(missing)?;
        let outs = Self::decode_entry(&bytes)?;

        let before = outs.len();
        let remaining: Vec<UnspentOutput> = outs
            .into_iter()
            .filter(|unspent| unspent.index as i64 != vout)
            .collect();
        if remaining.len() == before {
            return Err(missing());
        }

        if remaining.is_empty() {
            write.delete(Bucket::Chainstate, txid);
        } else {
            write.put(Bucket::Chainstate, txid, serialize(&remaining)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MiningConfig, TXInput, BLOCK_SUBSIDY};
    use crate::storage::{LedgerStore, MemoryStore};
    use crate::wallet::Wallet;
    use std::sync::Arc;

    fn setup() -> (UTXOSet, Wallet) {
        let owner = Wallet::new().unwrap();
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let mining = MiningConfig::new(6, 1).unwrap();
        let blockchain =
            Blockchain::initialize(store, &owner.get_pub_key_hash(), mining).unwrap();
        let utxo_set = UTXOSet::new(blockchain);
        utxo_set.reindex().unwrap();
        (utxo_set, owner)
    }

    fn genesis_txid(utxo_set: &UTXOSet) -> Vec<u8> {
        let genesis = utxo_set.get_blockchain().iterator().last().unwrap().unwrap();
        genesis.get_transactions()[0].get_id().to_vec()
    }

    /// Splits the owner's genesis reward into `values` paid to `to`; the rest
    /// goes back to the owner as a last output.
    fn fund(utxo_set: &UTXOSet, owner: &Wallet, to: &[u8], values: &[u64]) -> Transaction {
        let input = TXInput::new(&genesis_txid(utxo_set), 0, owner.get_public_key());
        let mut outputs: Vec<TXOutput> = values
            .iter()
            .map(|value| TXOutput::new(*value, to))
            .collect();
        let change = BLOCK_SUBSIDY - values.iter().sum::<u64>();
        if change > 0 {
            outputs.push(TXOutput::new(change, &owner.get_pub_key_hash()));
        }

        let mut split = Transaction::new(vec![input], outputs).unwrap();
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut split, owner.get_pkcs8())
            .unwrap();
        utxo_set.append_block(&[split.clone()]).unwrap();
        split
    }

    #[test]
    fn test_genesis_reward_is_indexed() {
        let (utxo_set, owner) = setup();
        assert_eq!(utxo_set.count_transactions().unwrap(), 1);
        assert_eq!(
            utxo_set.get_balance(&owner.get_pub_key_hash()).unwrap(),
            BLOCK_SUBSIDY
        );
    }

    #[test]
    fn test_spend_selection_reaches_amount() {
        let (utxo_set, owner) = setup();
        let key_hash = [42u8; 20];
        fund(&utxo_set, &owner, &key_hash, &[5, 7, 10]);
        assert_eq!(utxo_set.get_balance(&key_hash).unwrap(), 22);

        let (accumulated, selected) = utxo_set.find_spendable_outputs(&key_hash, 12).unwrap();
        assert!(accumulated >= 12);

        let entries = utxo_set.entries().unwrap();
        let selected_total: u64 = selected
            .iter()
            .flat_map(|(txid_hex, indices)| {
                let txid = HEXLOWER.decode(txid_hex.as_bytes()).unwrap();
                let outs = entries[&txid].clone();
                indices
                    .iter()
                    .map(move |index| {
                        outs.iter()
                            .find(|unspent| unspent.index == *index)
                            .unwrap()
                            .output
                            .get_value()
                    })
                    .collect::<Vec<_>>()
            })
            .sum();
        assert_eq!(selected_total, accumulated);

        let (accumulated, _) = utxo_set.find_spendable_outputs(&key_hash, 23).unwrap();
        assert!(accumulated < 23);
    }

    #[test]
    fn test_update_keeps_original_output_indices() {
        let (utxo_set, owner) = setup();
        let owner_hash = owner.get_pub_key_hash();
        let genesis_txid = genesis_txid(&utxo_set);

        // Three outputs of 10 plus 70 change, then spend only the middle one.
        let split = fund(&utxo_set, &owner, &owner_hash, &[10, 10, 10]);
        let middle = TXInput::new(split.get_id(), 1, owner.get_public_key());
        let mut spend =
            Transaction::new(vec![middle], vec![TXOutput::new(10, &[9; 20])]).unwrap();
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut spend, owner.get_pkcs8())
            .unwrap();
        utxo_set.append_block(&[spend]).unwrap();

        let entries = utxo_set.entries().unwrap();
        let indices: Vec<usize> = entries[split.get_id()]
            .iter()
            .map(|unspent| unspent.index)
            .collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert!(!entries.contains_key(&genesis_txid));

        let incremental = utxo_set.entries().unwrap();
        utxo_set.reindex().unwrap();
        assert_eq!(utxo_set.entries().unwrap(), incremental);
    }

    #[test]
    fn test_same_memo_rewards_match_reindex() {
        let (utxo_set, owner) = setup();
        let owner_hash = owner.get_pub_key_hash();
        for _ in 0..2 {
            let reward = Transaction::new_coinbase_tx(&owner_hash, "same").unwrap();
            utxo_set.append_block(&[reward]).unwrap();
        }
        assert_eq!(utxo_set.get_balance(&owner_hash).unwrap(), 3 * BLOCK_SUBSIDY);
        assert_eq!(utxo_set.count_transactions().unwrap(), 3);

        let incremental = utxo_set.entries().unwrap();
        utxo_set.reindex().unwrap();
        assert_eq!(utxo_set.entries().unwrap(), incremental);
        assert_eq!(utxo_set.get_balance(&owner_hash).unwrap(), 3 * BLOCK_SUBSIDY);
    }

    #[test]
    fn test_update_twice_is_detected() {
        let (utxo_set, owner) = setup();
        let input = TXInput::new(&genesis_txid(&utxo_set), 0, owner.get_public_key());
        let mut spend =
            Transaction::new(vec![input], vec![TXOutput::new(BLOCK_SUBSIDY, &[1; 20])]).unwrap();
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut spend, owner.get_pkcs8())
            .unwrap();
        let block = utxo_set.append_block(&[spend]).unwrap();

        assert!(matches!(
            utxo_set.update(&block),
            Err(LedgerError::UtxoNotFound { .. })
        ));
    }
}

// This is where value actually moves around in my ledger.
// I'm following the pay-to-pubkey-hash model: every output is locked to the hash
// of a public key, and every input points back at one earlier output and proves
// ownership with its own signature. Because each input signs separately, one
// transaction can pull together outputs that belong to different keys.

use crate::core::{Blockchain, BLOCK_SUBSIDY};
use crate::error::{LedgerError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, hash_pub_key,
    serialize, sha256_digest,
};
use crate::wallet::Wallet;
use data_encoding::HEXLOWER;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

/// A reference to an earlier output plus the proof that the spender owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    /// Spender's raw public key; arbitrary unlock data for coinbase inputs
    pub_key: Vec<u8>,
}

impl TXInput {
    /// Unsigned input spending output `vout` of transaction `txid`.
    pub fn new(txid: &[u8], vout: usize, pub_key: &[u8]) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout: vout as i64,
            signature: vec![],
            pub_key: pub_key.to_vec(),
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output position, `None` for the coinbase sentinel.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }
}

/// An amount locked to the hash of a public key.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    pub fn new(value: u64, pub_key_hash: &[u8]) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    /// Content hash with `id` itself blanked
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Assembles an unsigned transaction and assigns its id.
    pub fn new(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// When I mine a block I pay myself with a coinbase: one special input
    /// that spends nothing, and one output worth exactly `BLOCK_SUBSIDY`.
    pub fn new_coinbase_tx(to_pub_key_hash: &[u8], memo: &str) -> Result<Transaction> {
        Self::coinbase(to_pub_key_hash, memo, BLOCK_SUBSIDY)
    }

    /// Coinbase with an arbitrary reward, only for building fixtures.
    #[cfg(test)]
    pub(crate) fn new_coinbase_tx_with_reward(
        to_pub_key_hash: &[u8],
        memo: &str,
        reward: u64,
    ) -> Result<Transaction> {
        Self::coinbase(to_pub_key_hash, memo, reward)
    }

    fn coinbase(to_pub_key_hash: &[u8], memo: &str, reward: u64) -> Result<Transaction> {
        // The memo is kept, but I always append fresh UUID bytes after it.
        // Without them two rewards to the same key with the same memo would
        // hash to the same id and the UTXO cache could not tell them apart.
        let mut unlock_data = memo.as_bytes().to_vec();
        unlock_data.extend_from_slice(Uuid::new_v4().as_bytes());

        // No previous output here: empty txid plus the -1 sentinel
        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: unlock_data,
        };
        Self::new(vec![tx_input], vec![TXOutput::new(reward, to_pub_key_hash)])
    }

    /// Builds and signs a spend of `amount` from `wallet` to `to_pub_key_hash`,
    /// returning any surplus to the wallet as change.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to_pub_key_hash: &[u8],
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(LedgerError::InvalidTransaction(
                "Amount must be positive".to_string(),
            ));
        }

        // First I find enough of my own unspent outputs to cover the amount
        let from_pub_key_hash = wallet.get_pub_key_hash();
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(&from_pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        // Sorted so the same wallet state always builds the same inputs
        let mut selected: Vec<_> = valid_outputs.into_iter().collect();
        selected.sort();

        let mut inputs = vec![];
        for (txid_hex, outs) in selected {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                LedgerError::Serialization(format!("Invalid transaction ID {txid_hex}: {e}"))
            })?;
            for out in outs {
                inputs.push(TXInput::new(&txid, out, wallet.get_public_key()));
            }
        }

        // One output for the recipient, and whatever is left comes back to me
        let mut outputs = vec![TXOutput::new(amount, to_pub_key_hash)];
        if accumulated > amount {
            outputs.push(TXOutput::new(accumulated - amount, &from_pub_key_hash));
        }

        let mut tx = Transaction::new(inputs, outputs)?;
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        Ok(tx)
    }

    /// Exactly one input, with an empty referenced id and the -1 sentinel.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    /// Resolves the output spent by `input` from the referenced transactions
    /// (keyed by hex id).
    fn referenced_output<'a>(
        input: &TXInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<&'a TXOutput> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs
            .get(&txid_hex)
            .ok_or_else(|| LedgerError::MissingTransaction(txid_hex.clone()))?;
        input
            .output_index()
            .and_then(|index| prev_tx.vout.get(index))
            .ok_or(LedgerError::InvalidOutputIndex {
                txid: txid_hex,
                index: input.get_vout(),
            })
    }

    /// Digest signed by input `input_index`: a trimmed copy of the
    /// transaction whose signing input carries the referenced output's
    /// key-hash in place of its public key.
    pub fn canonical_digest(
        &self,
        input_index: usize,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<Vec<u8>> {
        let input = self.vin.get(input_index).ok_or_else(|| {
            LedgerError::InvalidTransaction(format!("Input {input_index} does not exist"))
        })?;
        let prev_output = Self::referenced_output(input, prev_txs)?;

        // Signatures and keys are stripped, then only the signing input gets
        // the locking key-hash, so every input signs a different digest
        let mut tx_copy = self.trimmed_copy();
        tx_copy.vin[input_index].pub_key = prev_output.pub_key_hash.clone();
        tx_copy.hash()
    }

    fn check_references(&self, prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        for input in &self.vin {
            Self::referenced_output(input, prev_txs)?;
        }
        Ok(())
    }

    /// Signs every input with `pkcs8`. No-op for coinbase transactions.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        self.check_references(prev_txs)?;

        for idx in 0..self.vin.len() {
            let digest = self.canonical_digest(idx, prev_txs)?;
            self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        }
        Ok(())
    }

    /// Checks ownership of every spent output. A missing referenced
    /// transaction is an error; a bad signature, a key that does not hash to
    /// the locking key-hash, a repeated outpoint or outputs worth more than
    /// the inputs make the result `false`.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        self.check_references(prev_txs)?;

        // The same outpoint twice would count its value twice
        let mut seen = HashSet::new();
        for input in &self.vin {
            if !seen.insert((input.get_txid(), input.get_vout())) {
                warn!(
                    "Transaction {} spends {}:{} twice",
                    HEXLOWER.encode(&self.id),
                    HEXLOWER.encode(input.get_txid()),
                    input.get_vout()
                );
                return Ok(false);
            }
        }

        if !self.verify_balance(prev_txs)? {
            warn!(
                "Transaction {} spends more than its inputs hold",
                HEXLOWER.encode(&self.id)
            );
            return Ok(false);
        }

        for (idx, input) in self.vin.iter().enumerate() {
            // The key has to be the one the output was locked to...
            let prev_output = Self::referenced_output(input, prev_txs)?;
            if !input.uses_key(prev_output.get_pub_key_hash()) {
                return Ok(false);
            }

            // ...and the signature has to match that key
            let digest = self.canonical_digest(idx, prev_txs)?;
            if !ecdsa_p256_sha256_sign_verify(
                input.pub_key.as_slice(),
                input.signature.as_slice(),
                &digest,
            ) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn verify_balance(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        let mut input_value = 0u64;
        for input in &self.vin {
            let prev_output = Self::referenced_output(input, prev_txs)?;
            match input_value.checked_add(prev_output.get_value()) {
                Some(sum) => input_value = sum,
                None => return Ok(false),
            }
        }
        Ok(self
            .get_output_value()
            .is_some_and(|output_value| output_value <= input_value))
    }

    pub fn get_output_value(&self) -> Option<u64> {
        self.vout
            .iter()
            .try_fold(0u64, |total, out| total.checked_add(out.get_value()))
    }

    /// SHA-256 of the transaction with `id` blanked.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    /// SHA-256 of the full encoded transaction, signatures included. This is
    /// the Merkle leaf, so any change to a stored transaction moves the root.
    pub fn content_hash(&self) -> Result<Vec<u8>> {
        Ok(sha256_digest(&self.serialize()?))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn set_output_value(&mut self, index: usize, value: u64) {
        self.vout[index].value = value;
    }

    #[cfg(test)]
    pub(crate) fn input_mut(&mut self, index: usize) -> &mut TXInput {
        &mut self.vin[index]
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", HEXLOWER.encode(&self.id))?;
        for (i, input) in self.vin.iter().enumerate() {
            writeln!(f, "    Input {i}:")?;
            writeln!(f, "        TXID:      {}", HEXLOWER.encode(&input.txid))?;
            writeln!(f, "        Out:       {}", input.vout)?;
            writeln!(f, "        Signature: {}", HEXLOWER.encode(&input.signature))?;
            writeln!(f, "        PubKey:    {}", HEXLOWER.encode(&input.pub_key))?;
        }
        for (i, output) in self.vout.iter().enumerate() {
            writeln!(f, "    Output {i}:")?;
            writeln!(f, "        Value:     {}", output.value)?;
            write!(f, "        Script:    {}", HEXLOWER.encode(&output.pub_key_hash))?;
            if i + 1 < self.vout.len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Looks up every transaction referenced by `tx`'s inputs, keyed by hex id.
pub(crate) fn collect_prev_transactions(
    blockchain: &Blockchain,
    tx: &Transaction,
) -> Result<HashMap<String, Transaction>> {
    let mut prev_txs = HashMap::new();
    for input in tx.get_vin() {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        if prev_txs.contains_key(&txid_hex) {
            continue;
        }
        let prev_tx = blockchain
            .find_transaction(input.get_txid())?
            .ok_or_else(|| LedgerError::MissingTransaction(txid_hex.clone()))?;
        prev_txs.insert(txid_hex, prev_tx);
    }
    Ok(prev_txs)
}

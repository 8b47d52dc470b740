/// Ledger amounts are plain unsigned integers with no sub-unit.
///
/// Value minted by every coinbase built through `Transaction::new_coinbase_tx`,
/// the genesis coinbase included.
pub const BLOCK_SUBSIDY: u64 = 100;

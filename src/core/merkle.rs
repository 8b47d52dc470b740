use crate::error::{LedgerError, Result};
use crate::utils::sha256_digest;
use serde::{Deserialize, Serialize};

/// Binary hash tree over a block's transaction hashes.
///
/// Built fresh for each block and thrown away once the root is taken; only
/// the root ever reaches the block hash. Every level is kept so inclusion
/// proofs can be cut from the same tree.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves, the last level holds the root alone
    levels: Vec<Vec<Vec<u8>>>,
}

/// Merkle proof for transaction inclusion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_hash: Vec<u8>,
    pub merkle_root: Vec<u8>,
    /// Sibling hashes from the leaf level upward
    pub proof_path: Vec<ProofElement>,
    pub leaf_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofElement {
    pub hash: Vec<u8>,
    /// true if the sibling sits to the right of the running hash
    pub is_right: bool,
}

impl MerkleTree {
    pub fn from_hashes(leaf_hashes: &[Vec<u8>]) -> Result<Self> {
        if leaf_hashes.is_empty() {
            return Err(LedgerError::EmptyMerkleTree);
        }

        let mut levels = vec![leaf_hashes.to_vec()];
        while let Some(current) = levels.last() {
            if current.len() == 1 {
                break;
            }
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Self::hash_pair(left, right),
                    // Odd count: pair the last node with itself
                    [last] => Self::hash_pair(last, last),
                    _ => unreachable!("chunks(2) yields one or two elements"),
                })
                .collect();
            levels.push(next);
        }

        Ok(MerkleTree { levels })
    }

    /// Root digest of an ordered, non-empty list of leaf hashes.
    pub fn compute_root(leaf_hashes: &[Vec<u8>]) -> Result<Vec<u8>> {
        Ok(Self::from_hashes(leaf_hashes)?.root().to_vec())
    }

    pub fn root(&self) -> &[u8] {
        // from_hashes never builds a tree without a root level
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn generate_proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        let leaf_hash = self.levels[0]
            .get(leaf_index)
            .cloned()
            .ok_or_else(|| {
                LedgerError::InvalidBlock(format!(
                    "Leaf index {leaf_index} out of bounds (leaves: {})",
                    self.leaf_count()
                ))
            })?;

        let mut proof_path = Vec::with_capacity(self.levels.len());
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = index % 2 == 0;
            let sibling_index = if is_right { index + 1 } else { index - 1 };
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);
            proof_path.push(ProofElement {
                hash: sibling.clone(),
                is_right,
            });
            index /= 2;
        }

        Ok(MerkleProof {
            leaf_hash,
            merkle_root: self.root().to_vec(),
            proof_path,
            leaf_index,
        })
    }

    fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut combined = Vec::with_capacity(left.len() + right.len());
        combined.extend_from_slice(left);
        combined.extend_from_slice(right);
        sha256_digest(&combined)
    }
}

impl MerkleProof {
    /// Recomputes the root from the leaf and its siblings.
    pub fn verify(&self) -> bool {
        let computed = self
            .proof_path
            .iter()
            .fold(self.leaf_hash.clone(), |current, element| {
                if element.is_right {
                    MerkleTree::hash_pair(&current, &element.hash)
                } else {
                    MerkleTree::hash_pair(&element.hash, &current)
                }
            });
        computed == self.merkle_root
    }
}

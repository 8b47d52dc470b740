//! Utility functions and helpers
//!
//! Hashing, signatures, base58 and the bincode layer shared by
//! the core, storage and wallet modules.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    hash_pub_key, new_key_pair, public_key_from_pkcs8, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};

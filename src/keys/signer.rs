//! Validator signing keys
//!
//! A validator's address is its compressed secp256k1 public key, so a
//! signature over a digest can be checked against the address alone.

use super::Address;
use crate::error::{BridgeError, BridgeResult};

use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use std::fmt;

/// This node's validator key
#[derive(Clone)]
pub struct NodeKey {
    secret: SecretKey,
    address: Address,
}

impl NodeKey {
    pub fn from_secret_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| BridgeError::Config(format!("invalid validator key: {}", e)))?;
        let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
        Ok(Self {
            secret,
            address: Address::new(public.serialize().to_vec()),
        })
    }

    pub fn from_hex(s: &str) -> BridgeResult<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| BridgeError::Config(format!("validator key is not hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Compact ECDSA signature over a 32-byte digest
    pub fn sign_digest(&self, digest: [u8; 32]) -> Vec<u8> {
        let message = Message::from_digest(digest);
        Secp256k1::signing_only()
            .sign_ecdsa(&message, &self.secret)
            .serialize_compact()
            .to_vec()
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.address)
    }
}

/// Addresses that can sign must be compressed public keys
pub fn check_public_key(address: &Address) -> BridgeResult<PublicKey> {
    PublicKey::from_slice(address.as_bytes()).map_err(|_| {
        BridgeError::Validation(format!("{} is not a compressed public key", address))
    })
}

/// Check that `address` signed `digest`
pub fn verify_digest(address: &Address, digest: [u8; 32], signature: &[u8]) -> BridgeResult<()> {
    let unauthorized = || BridgeError::Unauthorized {
        address: address.to_string(),
    };
    let public = check_public_key(address).map_err(|_| unauthorized())?;
    let signature = ecdsa::Signature::from_compact(signature).map_err(|_| unauthorized())?;
    Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(digest), &signature, &public)
        .map_err(|_| unauthorized())
}

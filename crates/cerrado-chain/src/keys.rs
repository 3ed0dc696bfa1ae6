//! ECDSA key and signature wrappers. The curve math itself is secp256k1;
//! this module owns the protocol-side concerns: the hash-type byte
//! appended to signatures, lax DER acceptance before strict encoding
//! became mandatory, and address derivation.

use cerrado_common::base58_encode;
use cerrado_common::hash160;
use cerrado_common::Base58Type;
use cerrado_common::Hash160;
use cerrado_common::Hash256;
use secp256k1::ecdsa;
use secp256k1::Message;
use secp256k1::Secp256k1;
use secp256k1::SecretKey;

use crate::chainparams::Network;

/// Hash-type flags carried in the byte appended to each signature.
pub mod hash_type {
    pub const ALL: u8 = 0x01;
    pub const NONE: u8 = 0x02;
    pub const SINGLE: u8 = 0x03;
    /// Required once the cash fork activates, forbidden before.
    pub const FORKID: u8 = 0x40;
    pub const ANYONECANPAY: u8 = 0x80;

    /// The base type with the modifier bits masked off.
    pub fn base(hash_type: u8) -> u8 {
        hash_type & !(FORKID | ANYONECANPAY)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrivateKey(SecretKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(secp256k1::PublicKey);

/// A parsed ECDSA signature plus the hash-type byte it arrived with.
#[derive(Debug, Clone)]
pub struct Signature {
    inner: ecdsa::Signature,
    hash_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    InvalidPrivateKey,
    InvalidPublicKey,
    InvalidSignature,
}

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        SecretKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey(secp256k1::PublicKey::from_secret_key(&secp, &self.0))
    }

    /// Sign a 32-byte digest, returning the DER signature with the
    /// hash-type byte appended, ready to push on a script stack.
    pub fn sign(&self, digest: &Hash256, hash_type: u8) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let message =
            Message::from_digest_slice(digest.as_bytes()).expect("digest is 32 bytes");
        let signature = secp.sign_ecdsa(&message, &self.0);
        let mut out = signature.serialize_der().to_vec();
        out.push(hash_type);
        out
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        secp256k1::PublicKey::from_slice(bytes)
            .map(PublicKey)
            .map_err(|_| KeyError::InvalidPublicKey)
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.0.serialize().to_vec()
    }

    pub fn hash(&self) -> Hash160 {
        hash160(&self.0.serialize())
    }

    pub fn address(&self, network: Network) -> String {
        let kind = match network {
            Network::Mainnet => Base58Type::PublicKeyHash,
            Network::Testnet => Base58Type::TestPublicKeyHash,
        };
        base58_encode(kind, self.hash().as_bytes())
    }
}

impl Signature {
    /// Parse a stack item: DER bytes followed by the hash-type byte.
    /// Before strict DER activates, common malformed encodings (stray
    /// padding in R and S) are still accepted.
    pub fn from_stack_item(bytes: &[u8], strict_der: bool) -> Result<Self, KeyError> {
        if bytes.len() < 2 {
            return Err(KeyError::InvalidSignature);
        }
        let (der, hash_type) = bytes.split_at(bytes.len() - 1);
        let inner = if strict_der {
            ecdsa::Signature::from_der(der).map_err(|_| KeyError::InvalidSignature)?
        } else {
            ecdsa::Signature::from_der_lax(der).map_err(|_| KeyError::InvalidSignature)?
        };
        Ok(Signature {
            inner,
            hash_type: hash_type[0],
        })
    }

    pub fn hash_type(&self) -> u8 {
        self.hash_type
    }

    pub fn verify(&self, public_key: &PublicKey, digest: &Hash256) -> bool {
        let Ok(message) = Message::from_digest_slice(digest.as_bytes()) else {
            return false;
        };
        let secp = Secp256k1::verification_only();
        // Consensus accepts high-S signatures; secp256k1 does not
        let mut normalized = self.inner;
        normalized.normalize_s();
        secp.verify_ecdsa(&message, &normalized, &public_key.0).is_ok()
    }
}

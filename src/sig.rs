//! Creation and verification of (Ethereum) signatures.
//!
//! States, proposals and vouchers are all signed over the
//! `\x19Ethereum Signed Message:\n32` digest of their canonical hash, which
//! is the format the on-chain adjudicator verifies.

use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as _},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::{Address, Hash, Signature};

#[derive(Debug, Error)]
pub enum SigError {
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("signing failed: {0}")]
    Signing(k256::ecdsa::Error),
    #[error("signature recovery failed: {0}")]
    Recovery(k256::ecdsa::Error),
    #[error("malformed signature")]
    Malformed,
}

/// Add the `\x19Ethereum Signed Message:\n32` prefix to a hash.
///
/// Packed encoding, so this bypasses the abi serializer.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    // The first byte of the uncompressed encoding is the SEC1 tag, which is
    // not part of the public key. The address is the low 20 bytes of the
    // keccak hash of the remaining 64.
    let pk_bytes: [u8; 65] = key
        .to_encoded_point(false)
        .as_bytes()
        .try_into()
        .expect("uncompressed secp256k1 point is 65 bytes");
    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// Holds a secret key and signs prehashed messages with it.
#[derive(Debug, Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl Signer {
    pub fn new(secret_key: &[u8; 32]) -> Result<Self, SigError> {
        let key = SigningKey::from_bytes(secret_key).map_err(|_| SigError::InvalidSecretKey)?;
        let addr = address_from_verifying_key(&key.verifying_key());
        Ok(Signer { key, addr })
    }

    pub fn random<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let bytes: [u8; 32] = rng.gen();
        // A uniformly random 32-byte string is a valid secp256k1 scalar with
        // overwhelming probability; resample on the pathological case.
        match Signer::new(&bytes) {
            Ok(s) => s,
            Err(_) => Signer::random(rng),
        }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs the eth-prefixed digest of `msg`, returning 65 bytes (r, s, v)
    /// with v in {27, 28}.
    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, SigError> {
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature =
            self.key.sign_prehash(&hash.0).map_err(SigError::Signing)?;

        // The recoverable signature is already laid out as r ‖ s ‖ v, but v
        // must be shifted by 27 to be valid in the EVM.
        let mut sig_bytes: [u8; 65] = sig
            .as_bytes()
            .try_into()
            .map_err(|_| SigError::Malformed)?;
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }
}

/// Derives the address which produced `eth_sig` over the eth-prefixed
/// digest of `msg`.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, SigError> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    let mut sig_bytes: [u8; 65] = eth_sig.0;
    if sig_bytes[64] < 27 {
        return Err(SigError::Malformed);
    }
    sig_bytes[64] -= 27;

    let sig = recoverable::Signature::from_bytes(&sig_bytes).map_err(SigError::Recovery)?;
    let verifying_key = sig
        .recover_verifying_key_from_digest_bytes(&hash.0.into())
        .map_err(SigError::Recovery)?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Derives the address for a raw secret key.
pub fn address_from_secret_key(secret_key: &[u8; 32]) -> Result<Address, SigError> {
    Ok(Signer::new(secret_key)?.address())
}

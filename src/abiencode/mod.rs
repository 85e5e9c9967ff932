//! Canonical (Solidity-ABI) encoding of channel data.
//!
//! Everything hashed or signed in this crate goes through this module so the
//! byte layout stays bit-exact with the on-chain adjudicator: 32-byte slots,
//! head/tail encoding for dynamic values, keccak256 for hashing.
//!
//! The encoder works over an explicit [Token] model rather than a serde
//! backend because the protocol also needs to *decode* outcomes received
//! from the chain and from peers, and the set of encoded shapes is small and
//! fixed (fixed part, state, outcome, guarantee metadata, voucher digest).

use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::{Address, Hash, U256};

pub const SLOT_SIZE: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("abi data truncated: wanted {wanted} bytes at offset {offset}, have {have}")]
    Truncated {
        wanted: usize,
        offset: usize,
        have: usize,
    },
    #[error("abi offset or length out of range")]
    OutOfRange,
    #[error("invalid boolean slot")]
    InvalidBool,
    #[error("value does not fit the target width")]
    Width,
}

pub type Result<T> = core::result::Result<T, Error>;

/// One ABI value. Arrays are homogeneous; the caller guarantees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(U256),
    Address(Address),
    Bytes32([u8; 32]),
    Bool(bool),
    Bytes(Vec<u8>),
    Tuple(Vec<Token>),
    Array(Vec<Token>),
}

/// Schema for decoding: mirrors [Token] minus the values.
#[derive(Debug, Clone)]
pub enum Kind {
    Uint,
    Address,
    Bytes32,
    Bool,
    Bytes,
    Tuple(Vec<Kind>),
    Array(Box<Kind>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(inner) => inner.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Number of head bytes this token occupies inside a tuple.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            SLOT_SIZE
        } else {
            match self {
                Token::Tuple(inner) => inner.iter().map(Token::head_size).sum(),
                _ => SLOT_SIZE,
            }
        }
    }

    /// Standalone encoding of this token (the form used in a tail).
    fn encode_value(&self, out: &mut Vec<u8>) {
        match self {
            Token::Uint(v) => out.extend_from_slice(&v.to_be_bytes()),
            Token::Address(a) => {
                // Addresses are right-aligned in their slot, like uints.
                let mut slot = [0u8; SLOT_SIZE];
                slot[SLOT_SIZE - 20..].copy_from_slice(&a.0);
                out.extend_from_slice(&slot);
            }
            Token::Bytes32(b) => out.extend_from_slice(b),
            Token::Bool(b) => {
                let mut slot = [0u8; SLOT_SIZE];
                slot[SLOT_SIZE - 1] = u8::from(*b);
                out.extend_from_slice(&slot);
            }
            Token::Bytes(data) => {
                out.extend_from_slice(&U256::from(data.len()).to_be_bytes());
                out.extend_from_slice(data);
                let pad = (SLOT_SIZE - data.len() % SLOT_SIZE) % SLOT_SIZE;
                out.extend_from_slice(&vec![0u8; pad]);
            }
            Token::Tuple(inner) => encode_tuple(inner, out),
            Token::Array(items) => {
                out.extend_from_slice(&U256::from(items.len()).to_be_bytes());
                encode_tuple(items, out);
            }
        }
    }
}

fn encode_tuple(tokens: &[Token], out: &mut Vec<u8>) {
    let head_size: usize = tokens.iter().map(Token::head_size).sum();
    let base = out.len();
    let mut tail: Vec<u8> = Vec::new();

    for t in tokens {
        if t.is_dynamic() {
            out.extend_from_slice(&U256::from(head_size + tail.len()).to_be_bytes());
            t.encode_value(&mut tail);
        } else {
            t.encode_value(out);
        }
    }

    debug_assert_eq!(out.len() - base, head_size);
    out.extend_from_slice(&tail);
}

/// Encodes a sequence of values the way `abi.encode(...)` does.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_tuple(tokens, &mut out);
    out
}

/// keccak256 over the canonical encoding.
pub fn to_hash(tokens: &[Token]) -> Hash {
    Hash(Keccak256::digest(encode(tokens)).into())
}

/// keccak256 over raw bytes (packed hashing, used for the eth message
/// prefix and fingerprints).
pub fn keccak(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}

impl Kind {
    fn is_dynamic(&self) -> bool {
        match self {
            Kind::Bytes | Kind::Array(_) => true,
            Kind::Tuple(inner) => inner.iter().any(Kind::is_dynamic),
            _ => false,
        }
    }

    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            SLOT_SIZE
        } else {
            match self {
                Kind::Tuple(inner) => inner.iter().map(Kind::head_size).sum(),
                _ => SLOT_SIZE,
            }
        }
    }
}

fn slot(data: &[u8], offset: usize) -> Result<[u8; SLOT_SIZE]> {
    let end = offset.checked_add(SLOT_SIZE).ok_or(Error::OutOfRange)?;
    if end > data.len() {
        return Err(Error::Truncated {
            wanted: SLOT_SIZE,
            offset,
            have: data.len(),
        });
    }
    let mut s = [0u8; SLOT_SIZE];
    s.copy_from_slice(&data[offset..end]);
    Ok(s)
}

fn usize_slot(data: &[u8], offset: usize) -> Result<usize> {
    let v = U256::from_be_bytes(slot(data, offset)?);
    if v > U256::from(usize::MAX) {
        return Err(Error::OutOfRange);
    }
    Ok(v.as_usize())
}

/// Decodes a standalone value of the given kind from `data`.
fn decode_value(data: &[u8], kind: &Kind) -> Result<Token> {
    match kind {
        Kind::Uint => Ok(Token::Uint(U256::from_be_bytes(slot(data, 0)?))),
        Kind::Address => {
            let s = slot(data, 0)?;
            if s[..SLOT_SIZE - 20] != [0; SLOT_SIZE - 20] {
                return Err(Error::Width);
            }
            let mut a = Address([0; 20]);
            a.0.copy_from_slice(&s[SLOT_SIZE - 20..]);
            Ok(Token::Address(a))
        }
        Kind::Bytes32 => Ok(Token::Bytes32(slot(data, 0)?)),
        Kind::Bool => {
            let s = slot(data, 0)?;
            match (s[..SLOT_SIZE - 1] == [0; SLOT_SIZE - 1], s[SLOT_SIZE - 1]) {
                (true, 0) => Ok(Token::Bool(false)),
                (true, 1) => Ok(Token::Bool(true)),
                _ => Err(Error::InvalidBool),
            }
        }
        Kind::Bytes => {
            let len = usize_slot(data, 0)?;
            let end = SLOT_SIZE.checked_add(len).ok_or(Error::OutOfRange)?;
            if end > data.len() {
                return Err(Error::Truncated {
                    wanted: len,
                    offset: SLOT_SIZE,
                    have: data.len(),
                });
            }
            Ok(Token::Bytes(data[SLOT_SIZE..end].to_vec()))
        }
        Kind::Tuple(kinds) => Ok(Token::Tuple(decode_tuple(data, kinds)?)),
        Kind::Array(elem) => {
            let len = usize_slot(data, 0)?;
            let body = &data[SLOT_SIZE..];
            let kinds = vec![(**elem).clone(); len];
            Ok(Token::Array(decode_tuple(body, &kinds)?))
        }
    }
}

fn decode_tuple(data: &[u8], kinds: &[Kind]) -> Result<Vec<Token>> {
    let mut tokens = Vec::with_capacity(kinds.len());
    let mut pos = 0usize;
    for kind in kinds {
        if kind.is_dynamic() {
            let offset = usize_slot(data, pos)?;
            if offset > data.len() {
                return Err(Error::OutOfRange);
            }
            tokens.push(decode_value(&data[offset..], kind)?);
            pos += SLOT_SIZE;
        } else {
            tokens.push(decode_value(&data[pos..], kind)?);
            pos += kind.head_size();
        }
    }
    Ok(tokens)
}

/// Decodes a sequence of values encoded with [encode].
pub fn decode(data: &[u8], kinds: &[Kind]) -> Result<Vec<Token>> {
    decode_tuple(data, kinds)
}

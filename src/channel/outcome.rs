//! Multi-asset outcome model and its canonical encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abiencode::{self, Kind, Token};
use crate::types::{Address, Destination, Funds, Hash, U256};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("abi error: {0}")]
    Abi(#[from] abiencode::Error),
    #[error("guarantee metadata must be exactly 64 bytes")]
    BadGuaranteeMetadata,
    #[error("decoded token had an unexpected shape")]
    Shape,
    #[error("unknown allocation type {0}")]
    UnknownAllocationType(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationType {
    Simple,
    Guarantee,
}

impl AllocationType {
    fn as_u8(self) -> u8 {
        match self {
            AllocationType::Simple => 0,
            AllocationType::Guarantee => 1,
        }
    }
}

/// One payout entry inside a single-asset exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn simple(destination: Destination, amount: U256) -> Self {
        Allocation {
            destination,
            amount,
            allocation_type: AllocationType::Simple,
            metadata: Vec::new(),
        }
    }

    pub fn guarantee(target: Destination, amount: U256, meta: GuaranteeMetadata) -> Self {
        Allocation {
            destination: target,
            amount,
            allocation_type: AllocationType::Guarantee,
            metadata: meta.encode(),
        }
    }
}

/// `left ‖ right`, 32 bytes each, packed (not abi-encoded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
}

impl GuaranteeMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.left.0);
        out.extend_from_slice(&self.right.0);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, OutcomeError> {
        if data.len() != 64 {
            return Err(OutcomeError::BadGuaranteeMetadata);
        }
        let mut left = Destination([0; 32]);
        let mut right = Destination([0; 32]);
        left.0.copy_from_slice(&data[..32]);
        right.0.copy_from_slice(&data[32..]);
        Ok(GuaranteeMetadata { left, right })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub asset_type: u8,
    pub metadata: Vec<u8>,
}

/// Payouts for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleAssetExit {
    pub asset: Address,
    pub asset_metadata: AssetMetadata,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    pub fn total_allocated(&self) -> U256 {
        self.allocations.iter().fold(U256::zero(), |acc, a| {
            acc.checked_add(a.amount)
                .expect("allocation totals cannot exceed 2^256")
        })
    }
}

/// An ordered list of single-asset exits: the full outcome of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Exit(pub Vec<SingleAssetExit>);

fn allocation_kind() -> Kind {
    Kind::Tuple(vec![Kind::Bytes32, Kind::Uint, Kind::Uint, Kind::Bytes])
}

fn single_asset_exit_kind() -> Kind {
    Kind::Tuple(vec![
        Kind::Address,
        Kind::Tuple(vec![Kind::Uint, Kind::Bytes]),
        Kind::Array(Box::new(allocation_kind())),
    ])
}

pub(crate) fn exit_kind() -> Kind {
    Kind::Array(Box::new(single_asset_exit_kind()))
}

impl Exit {
    pub fn as_token(&self) -> Token {
        Token::Array(
            self.0
                .iter()
                .map(|sae| {
                    Token::Tuple(vec![
                        Token::Address(sae.asset),
                        Token::Tuple(vec![
                            Token::Uint(U256::from(sae.asset_metadata.asset_type)),
                            Token::Bytes(sae.asset_metadata.metadata.clone()),
                        ]),
                        Token::Array(
                            sae.allocations
                                .iter()
                                .map(|a| {
                                    Token::Tuple(vec![
                                        Token::Bytes32(a.destination.0),
                                        Token::Uint(a.amount),
                                        Token::Uint(U256::from(a.allocation_type.as_u8())),
                                        Token::Bytes(a.metadata.clone()),
                                    ])
                                })
                                .collect(),
                        ),
                    ])
                })
                .collect(),
        )
    }

    /// Canonical ABI encoding, bit-exact with the adjudicator.
    pub fn encode(&self) -> Vec<u8> {
        abiencode::encode(&[self.as_token()])
    }

    pub fn decode(data: &[u8]) -> Result<Self, OutcomeError> {
        let tokens = abiencode::decode(data, &[exit_kind()])?;
        Self::from_token(tokens.into_iter().next().ok_or(OutcomeError::Shape)?)
    }

    pub(crate) fn from_token(token: Token) -> Result<Self, OutcomeError> {
        let saes = match token {
            Token::Array(items) => items,
            _ => return Err(OutcomeError::Shape),
        };
        let mut out = Vec::with_capacity(saes.len());
        for sae in saes {
            let mut parts = match sae {
                Token::Tuple(parts) if parts.len() == 3 => parts.into_iter(),
                _ => return Err(OutcomeError::Shape),
            };
            let asset = match parts.next() {
                Some(Token::Address(a)) => a,
                _ => return Err(OutcomeError::Shape),
            };
            let asset_metadata = match parts.next() {
                Some(Token::Tuple(meta)) if meta.len() == 2 => match (&meta[0], &meta[1]) {
                    (Token::Uint(t), Token::Bytes(b)) => AssetMetadata {
                        asset_type: t.low_u64() as u8,
                        metadata: b.clone(),
                    },
                    _ => return Err(OutcomeError::Shape),
                },
                _ => return Err(OutcomeError::Shape),
            };
            let allocations = match parts.next() {
                Some(Token::Array(allocs)) => allocs
                    .into_iter()
                    .map(Allocation::from_token)
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(OutcomeError::Shape),
            };
            out.push(SingleAssetExit {
                asset,
                asset_metadata,
                allocations,
            });
        }
        Ok(Exit(out))
    }

    pub fn hash(&self) -> Hash {
        abiencode::to_hash(&[self.as_token()])
    }

    /// Sum of amounts per asset.
    pub fn total_allocated(&self) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let prev = funds.get(&sae.asset);
            funds.insert(
                sae.asset,
                prev.checked_add(sae.total_allocated())
                    .expect("allocation totals cannot exceed 2^256"),
            );
        }
        funds
    }

    /// Sum of amounts per asset, restricted to allocations listed before
    /// `destination` within each asset. Used for the deposit
    /// safety-threshold arithmetic in direct funding: depositors pay in
    /// allocation order, so everything ahead of you must be on-chain
    /// before your own deposit is safe.
    pub fn total_allocated_before(&self, destination: Destination) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let mut total = U256::zero();
            for a in &sae.allocations {
                if a.destination == destination {
                    break;
                }
                total = total
                    .checked_add(a.amount)
                    .expect("allocation totals cannot exceed 2^256");
            }
            let prev = funds.get(&sae.asset);
            funds.insert(
                sae.asset,
                prev.checked_add(total).expect("cannot exceed 2^256"),
            );
        }
        funds
    }

    /// The amount allocated directly to `destination`, per asset.
    pub fn total_allocated_for(&self, destination: Destination) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let mut total = U256::zero();
            for a in &sae.allocations {
                if a.destination == destination {
                    total = total
                        .checked_add(a.amount)
                        .expect("allocation totals cannot exceed 2^256");
                }
            }
            let prev = funds.get(&sae.asset);
            funds.insert(
                sae.asset,
                prev.checked_add(total).expect("cannot exceed 2^256"),
            );
        }
        funds
    }
}

impl Allocation {
    fn from_token(token: Token) -> Result<Self, OutcomeError> {
        let parts = match token {
            Token::Tuple(parts) if parts.len() == 4 => parts,
            _ => return Err(OutcomeError::Shape),
        };
        match (&parts[0], &parts[1], &parts[2], &parts[3]) {
            (Token::Bytes32(dest), Token::Uint(amount), Token::Uint(t), Token::Bytes(meta)) => {
                let allocation_type = match t.low_u64() {
                    0 => AllocationType::Simple,
                    1 => AllocationType::Guarantee,
                    other => return Err(OutcomeError::UnknownAllocationType(other)),
                };
                Ok(Allocation {
                    destination: Destination(*dest),
                    amount: *amount,
                    allocation_type,
                    metadata: meta.clone(),
                })
            }
            _ => Err(OutcomeError::Shape),
        }
    }
}

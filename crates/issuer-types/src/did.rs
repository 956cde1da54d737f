//! Iden3 decentralized identifiers.
//!
//! A DID string has the shape `did:<method>:<blockchain>:<network>:<id>`
//! where `<id>` is the base58 encoding of a 31-byte identifier:
//!
//! ```text
//! typ (2) || genesis (27) || checksum (2)
//! ```
//!
//! `typ` packs the method byte and the blockchain/network flag, `genesis` is
//! the tail of the little-endian genesis state and the checksum is the
//! big-endian `u16` sum of the 29 preceding bytes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of the binary identifier.
pub const ID_LENGTH: usize = 31;

const GENESIS_LENGTH: usize = 27;

/// Errors produced while parsing or deriving a DID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DidError {
    /// The string is not `did:<method>:<blockchain>:<network>:<id>`.
    #[error("invalid did format: {0}")]
    InvalidFormat(String),
    /// The method is neither `iden3` nor `polygonid`.
    #[error("unsupported did method: {0}")]
    UnsupportedMethod(String),
    /// The blockchain/network pair is not known.
    #[error("unsupported network: {0}:{1}")]
    UnsupportedNetwork(String, String),
    /// The identifier is not valid base58 or has the wrong length.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    /// The trailing checksum does not match the identifier bytes.
    #[error("identifier checksum mismatch")]
    ChecksumMismatch,
    /// The identifier type bytes disagree with the textual method/network.
    #[error("identifier type does not match did method and network")]
    TypeMismatch,
}

/// DID method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DidMethod {
    Iden3,
    PolygonId,
}

impl DidMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iden3 => "iden3",
            Self::PolygonId => "polygonid",
        }
    }

    fn byte(self) -> u8 {
        match self {
            Self::Iden3 => 0b0000_0001,
            Self::PolygonId => 0b0000_0010,
        }
    }
}

impl FromStr for DidMethod {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iden3" => Ok(Self::Iden3),
            "polygonid" => Ok(Self::PolygonId),
            other => Err(DidError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Blockchain hosting the State contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blockchain {
    Ethereum,
    Polygon,
}

impl Blockchain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ethereum => "eth",
            Self::Polygon => "polygon",
        }
    }

    fn flag(self) -> u8 {
        match self {
            Self::Ethereum => 0b0010_0000,
            Self::Polygon => 0b0001_0000,
        }
    }
}

impl FromStr for Blockchain {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eth" | "ethereum" => Ok(Self::Ethereum),
            "polygon" => Ok(Self::Polygon),
            other => Err(DidError::UnsupportedNetwork(other.to_string(), String::new())),
        }
    }
}

/// Network of a blockchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkId {
    Main,
    Mumbai,
    Amoy,
    Goerli,
    Sepolia,
}

impl NetworkId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Mumbai => "mumbai",
            Self::Amoy => "amoy",
            Self::Goerli => "goerli",
            Self::Sepolia => "sepolia",
        }
    }
}

impl FromStr for NetworkId {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Self::Main),
            "mumbai" => Ok(Self::Mumbai),
            "amoy" => Ok(Self::Amoy),
            "goerli" => Ok(Self::Goerli),
            "sepolia" => Ok(Self::Sepolia),
            other => Err(DidError::UnsupportedNetwork(String::new(), other.to_string())),
        }
    }
}

/// Network flag byte and EVM chain id of a supported pair.
fn network_params(blockchain: Blockchain, network: NetworkId) -> Result<(u8, u64), DidError> {
    let (bits, chain_id) = match (blockchain, network) {
        (Blockchain::Polygon, NetworkId::Main) => (0b0000_0001, 137),
        (Blockchain::Polygon, NetworkId::Mumbai) => (0b0000_0010, 80_001),
        (Blockchain::Polygon, NetworkId::Amoy) => (0b0000_0011, 80_002),
        (Blockchain::Ethereum, NetworkId::Main) => (0b0000_0001, 1),
        (Blockchain::Ethereum, NetworkId::Goerli) => (0b0000_0010, 5),
        (Blockchain::Ethereum, NetworkId::Sepolia) => (0b0000_0011, 11_155_111),
        _ => {
            return Err(DidError::UnsupportedNetwork(
                blockchain.as_str().to_string(),
                network.as_str().to_string(),
            ))
        }
    };
    Ok((blockchain.flag() | bits, chain_id))
}

fn checksum(bytes: &[u8]) -> [u8; 2] {
    let sum = bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    sum.to_be_bytes()
}

/// A parsed Iden3 DID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Did {
    method: DidMethod,
    blockchain: Blockchain,
    network: NetworkId,
    id: [u8; ID_LENGTH],
}

impl Did {
    /// Derives the DID of an identity from its genesis state.
    ///
    /// `state_le` is the 32-byte little-endian encoding of the genesis state
    /// hash; its last 27 bytes become the identifier's genesis part.
    ///
    /// # Errors
    ///
    /// Returns [`DidError::UnsupportedNetwork`] for unknown blockchain/network
    /// pairs.
    pub fn from_genesis_state(
        method: DidMethod,
        blockchain: Blockchain,
        network: NetworkId,
        state_le: &[u8; 32],
    ) -> Result<Self, DidError> {
        let (flag, _) = network_params(blockchain, network)?;
        let mut id = [0u8; ID_LENGTH];
        id[0] = method.byte();
        id[1] = flag;
        id[2..2 + GENESIS_LENGTH].copy_from_slice(&state_le[32 - GENESIS_LENGTH..]);
        let sum = checksum(&id[..ID_LENGTH - 2]);
        id[ID_LENGTH - 2..].copy_from_slice(&sum);
        Ok(Self {
            method,
            blockchain,
            network,
            id,
        })
    }

    pub fn method(&self) -> DidMethod {
        self.method
    }

    pub fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    /// EVM chain id of the network this DID is anchored on.
    pub fn chain_id(&self) -> u64 {
        // The pair was validated at construction.
        network_params(self.blockchain, self.network)
            .map(|(_, chain_id)| chain_id)
            .unwrap_or_default()
    }

    /// The raw 31-byte identifier.
    pub fn id_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.id
    }

    /// The identifier as a 32-byte little-endian integer, ready to be read
    /// as a field element or encoded as a contract `uint256`.
    pub fn id_le_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..ID_LENGTH].copy_from_slice(&self.id);
        out
    }

    /// The 27-byte genesis part of the identifier.
    pub fn genesis(&self) -> &[u8] {
        &self.id[2..2 + GENESIS_LENGTH]
    }

    /// Whether `state_le` is the state this identifier was derived from.
    pub fn is_genesis_state(&self, state_le: &[u8; 32]) -> bool {
        self.genesis() == &state_le[32 - GENESIS_LENGTH..]
    }

    /// Base58 form of the identifier.
    pub fn id_base58(&self) -> String {
        bs58::encode(self.id).into_string()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "did:{}:{}:{}:{}",
            self.method.as_str(),
            self.blockchain.as_str(),
            self.network.as_str(),
            self.id_base58()
        )
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 5 || parts[0] != "did" {
            return Err(DidError::InvalidFormat(s.to_string()));
        }
        let method: DidMethod = parts[1].parse()?;
        let blockchain: Blockchain = parts[2]
            .parse()
            .map_err(|_| DidError::UnsupportedNetwork(parts[2].to_string(), parts[3].to_string()))?;
        let network: NetworkId = parts[3]
            .parse()
            .map_err(|_| DidError::UnsupportedNetwork(parts[2].to_string(), parts[3].to_string()))?;
        let (flag, _) = network_params(blockchain, network)?;

        let decoded = bs58::decode(parts[4])
            .into_vec()
            .map_err(|e| DidError::InvalidId(e.to_string()))?;
        let id: [u8; ID_LENGTH] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| DidError::InvalidId(format!("expected 31 bytes, got {}", v.len())))?;

        if checksum(&id[..ID_LENGTH - 2]) != id[ID_LENGTH - 2..] {
            return Err(DidError::ChecksumMismatch);
        }
        if id[0] != method.byte() || id[1] != flag {
            return Err(DidError::TypeMismatch);
        }

        Ok(Self {
            method,
            blockchain,
            network,
            id,
        })
    }
}

impl Serialize for Did {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//! Stacks c32check addresses.
//!
//! An address is `S` followed by the c32 version character and the c32
//! encoding of `hash160 || checksum`, where the checksum is the first four
//! bytes of a double SHA-256 over `version || hash160`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const MAINNET_SINGLE_SIG: u8 = 22;
pub const MAINNET_MULTI_SIG: u8 = 20;
pub const TESTNET_SINGLE_SIG: u8 = 26;
pub const TESTNET_MULTI_SIG: u8 = 21;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 'S'")]
    MissingPrefix,
    #[error("address too short")]
    TooShort,
    #[error("invalid c32 character: {0:?}")]
    InvalidCharacter(char),
    #[error("address checksum mismatch")]
    ChecksumMismatch,
    #[error("address payload must be 20 bytes, got {0}")]
    InvalidLength(usize),
    #[error("unknown address version {0}")]
    UnknownVersion(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn single_sig_version(self) -> u8 {
        match self {
            Self::Mainnet => MAINNET_SINGLE_SIG,
            Self::Testnet => TESTNET_SINGLE_SIG,
        }
    }

    pub fn transaction_version(self) -> u8 {
        match self {
            Self::Mainnet => 0x00,
            Self::Testnet => 0x80,
        }
    }

    pub fn chain_id(self) -> u32 {
        match self {
            Self::Mainnet => 0x0000_0001,
            Self::Testnet => 0x8000_0000,
        }
    }

    pub fn for_address_version(version: u8) -> Option<Self> {
        match version {
            MAINNET_SINGLE_SIG | MAINNET_MULTI_SIG => Some(Self::Mainnet),
            TESTNET_SINGLE_SIG | TESTNET_MULTI_SIG => Some(Self::Testnet),
            _ => None,
        }
    }

    pub fn for_transaction_version(version: u8) -> Option<Self> {
        match version {
            0x00 => Some(Self::Mainnet),
            0x80 => Some(Self::Testnet),
            _ => None,
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StacksAddress {
    pub version: u8,
    pub hash160: [u8; 20],
}

impl StacksAddress {
    pub fn new(version: u8, hash160: [u8; 20]) -> Result<Self, AddressError> {
        if Network::for_address_version(version).is_none() {
            return Err(AddressError::UnknownVersion(version));
        }
        Ok(Self { version, hash160 })
    }

    pub fn network(&self) -> Option<Network> {
        Network::for_address_version(self.version)
    }

    pub fn is_for_network(&self, network: Network) -> bool {
        self.network() == Some(network)
    }
}

impl FromStr for StacksAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.trim().strip_prefix('S').ok_or(AddressError::MissingPrefix)?;
        let (version, data) = c32check_decode(rest)?;
        let hash160: [u8; 20] = data
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::InvalidLength(data.len()))?;
        Self::new(version, hash160)
    }
}

impl fmt::Display for StacksAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", c32check_encode(self.version, &self.hash160))
    }
}

pub fn c32_encode(data: &[u8]) -> String {
    let leading_zeros = data.iter().take_while(|b| **b == 0).count();
    // little-endian base-32 digits
    let mut digits: Vec<u8> = Vec::new();
    for &byte in &data[leading_zeros..] {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 32) as u8;
            carry /= 32;
        }
        while carry > 0 {
            digits.push((carry % 32) as u8);
            carry /= 32;
        }
    }
    let mut out = String::with_capacity(leading_zeros + digits.len());
    out.extend(std::iter::repeat('0').take(leading_zeros));
    out.extend(
        digits
            .iter()
            .rev()
            .map(|d| char::from(C32_ALPHABET[usize::from(*d)])),
    );
    out
}

pub fn c32_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let normalized = c32_normalize(input);
    let leading_zeros = normalized.bytes().take_while(|b| *b == b'0').count();
    // little-endian base-256 bytes
    let mut bytes: Vec<u8> = Vec::new();
    for ch in normalized.bytes().skip(leading_zeros) {
        let value = C32_ALPHABET
            .iter()
            .position(|c| *c == ch)
            .ok_or(AddressError::InvalidCharacter(char::from(ch)))?;
        let mut carry = value as u32;
        for byte in bytes.iter_mut() {
            carry += u32::from(*byte) << 5;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; leading_zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

pub fn c32check_encode(version: u8, data: &[u8]) -> String {
    let mut payload = data.to_vec();
    payload.extend_from_slice(&checksum(version, data));
    let version_char = C32_ALPHABET
        .get(usize::from(version))
        .map(|c| char::from(*c))
        .unwrap_or('?');
    format!("{version_char}{}", c32_encode(&payload))
}

pub fn c32check_decode(input: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let normalized = c32_normalize(input);
    let mut chars = normalized.bytes();
    let version_char = chars.next().ok_or(AddressError::TooShort)?;
    let version = C32_ALPHABET
        .iter()
        .position(|c| *c == version_char)
        .ok_or(AddressError::InvalidCharacter(char::from(version_char)))? as u8;
    let decoded = c32_decode(&normalized[1..])?;
    if decoded.len() < 4 {
        return Err(AddressError::TooShort);
    }
    let (data, check) = decoded.split_at(decoded.len() - 4);
    if check != checksum(version, data) {
        return Err(AddressError::ChecksumMismatch);
    }
    Ok((version, data.to_vec()))
}

fn c32_normalize(input: &str) -> String {
    input
        .trim()
        .to_ascii_uppercase()
        .chars()
        .map(|c| match c {
            'O' => '0',
            'L' | 'I' => '1',
            other => other,
        })
        .collect()
}

fn checksum(version: u8, data: &[u8]) -> [u8; 4] {
    let mut hasher = Sha256::new();
    hasher.update([version]);
    hasher.update(data);
    let once = hasher.finalize();
    let twice = Sha256::digest(once);
    [twice[0], twice[1], twice[2], twice[3]]
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::{Network, StacksAddress};
use crate::ports::PortError;

/// Derivation path of the first Stacks account key.
pub const STX_DERIVATION_PATH: &str = "m/44'/5757'/0'/0/0";

const HARDENED_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletType {
    Software,
    Ledger,
}

/// What the device instructions should show while waiting on the Ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStep {
    Disconnected,
    ConnectedAppClosed,
    ConnectedAppOpen,
    HasAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxModalStep {
    DescribeTx,
    PreviewTx,
    DecryptWalletAndSend,
    SignWithLedgerAndSend,
}

/// Recipient and amounts collected by the describe step. All amounts are µSTX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub recipient: StacksAddress,
    pub amount: u64,
    pub fee: u64,
    pub total: u64,
}

impl TransactionDraft {
    pub fn new(recipient: StacksAddress, amount: u64, fee: u64) -> Result<Self, PortError> {
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| PortError::Validation("amount plus fee overflows".to_owned()))?;
        Ok(Self {
            recipient,
            amount,
            fee,
            total,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor(pub String);

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceDescriptor {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// BIP32 derivation path, e.g. `m/44'/5757'/0'/0/0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    components: Vec<u32>,
}

impl DerivationPath {
    pub fn stacks_default() -> Self {
        Self {
            components: vec![
                44 | HARDENED_BIT,
                5757 | HARDENED_BIT,
                HARDENED_BIT,
                0,
                0,
            ],
        }
    }

    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// Device encoding: exactly five little-endian u32 values.
    pub fn serialize_for_device(&self) -> Result<Vec<u8>, PortError> {
        if self.components.len() != 5 {
            return Err(PortError::Validation(format!(
                "device path must have 5 components, got {}",
                self.components.len()
            )));
        }
        let mut out = Vec::with_capacity(20);
        for component in &self.components {
            out.extend_from_slice(&component.to_le_bytes());
        }
        Ok(out)
    }

    pub fn from_device_bytes(bytes: &[u8]) -> Result<Self, PortError> {
        if bytes.len() != 20 {
            return Err(PortError::Validation(format!(
                "device path must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let components = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { components })
    }
}

impl Default for DerivationPath {
    fn default() -> Self {
        Self::stacks_default()
    }
}

impl FromStr for DerivationPath {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        if parts.next() != Some("m") {
            return Err(PortError::Validation(format!(
                "derivation path must start with m/: {s}"
            )));
        }
        let mut components = Vec::new();
        for part in parts {
            let (digits, hardened) = match part.strip_suffix('\'') {
                Some(d) => (d, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|e| PortError::Validation(format!("invalid path component {part}: {e}")))?;
            if index & HARDENED_BIT != 0 {
                return Err(PortError::Validation(format!(
                    "path component out of range: {part}"
                )));
            }
            components.push(if hardened { index | HARDENED_BIT } else { index });
        }
        if components.is_empty() {
            return Err(PortError::Validation("empty derivation path".to_owned()));
        }
        Ok(Self { components })
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for component in &self.components {
            if component & HARDENED_BIT != 0 {
                write!(f, "/{}'", component & !HARDENED_BIT)?;
            } else {
                write!(f, "/{component}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppVersion {
    pub test_mode: bool,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub device_locked: bool,
    pub target_id: Option<u32>,
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compressed secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyBytes(pub [u8; 33]);

impl PublicKeyBytes {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PortError> {
        let arr: [u8; 33] = bytes.try_into().map_err(|_| {
            PortError::Validation(format!(
                "compressed public key must be 33 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

/// Recoverable signature as carried by the spending condition: `recovery_id || r || s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSignature(pub [u8; 65]);

impl MessageSignature {
    pub const fn empty() -> Self {
        Self([0u8; 65])
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PortError> {
        let arr: [u8; 65] = bytes.try_into().map_err(|_| {
            PortError::Validation(format!("signature must be 65 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        alloy::hex::encode(self.0)
    }
}

/// Raw secp256k1 secret scalar. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SenderKey(pub [u8; 32]);

impl fmt::Debug for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SenderKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    Argon2idV1,
    Pbkdf2HmacSha256V1,
}

/// Password-protected software wallet key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedWallet {
    pub kdf_algorithm: KdfAlgorithm,
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedAddress {
    pub public_key: PublicKeyBytes,
    pub address: String,
}

/// Inputs for building a token transfer. `fee: None` lets the builder estimate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferParams {
    pub network: Network,
    pub recipient: StacksAddress,
    pub amount: u64,
    pub nonce: u64,
    pub fee: Option<u64>,
    pub memo: String,
}

/// Application state the send flow reads but does not own.
#[derive(Debug, Clone)]
pub struct WalletContext {
    pub wallet_type: WalletType,
    pub network: Network,
    pub sender: StacksAddress,
    pub balance: u64,
    pub nonce: u64,
    pub encrypted_wallet: Option<EncryptedWallet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub txid: String,
    pub amount: u64,
    pub fee: u64,
    pub total: u64,
}

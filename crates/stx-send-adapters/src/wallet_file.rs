//! On-disk wallet description: address, wallet type and, for software
//! wallets, the encrypted private key.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use stx_send_core::domain::{EncryptedWallet, KdfAlgorithm};
use stx_send_core::{Network, PortError, StacksAddress, WalletType};

pub const WALLET_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyRecord {
    pub kdf_algorithm: KdfAlgorithm,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletFile {
    pub version: u32,
    pub network: Network,
    pub address: String,
    pub wallet_type: WalletType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<EncryptedKeyRecord>,
}

impl WalletFile {
    pub fn software(network: Network, address: &StacksAddress, wallet: &EncryptedWallet) -> Self {
        Self {
            version: WALLET_FILE_VERSION,
            network,
            address: address.to_string(),
            wallet_type: WalletType::Software,
            encrypted_key: Some(EncryptedKeyRecord {
                kdf_algorithm: wallet.kdf_algorithm,
                salt: BASE64.encode(wallet.salt),
                nonce: BASE64.encode(wallet.nonce),
                ciphertext: BASE64.encode(&wallet.ciphertext),
            }),
        }
    }

    pub fn ledger(network: Network, address: &StacksAddress) -> Self {
        Self {
            version: WALLET_FILE_VERSION,
            network,
            address: address.to_string(),
            wallet_type: WalletType::Ledger,
            encrypted_key: None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, PortError> {
        let file: Self = serde_json::from_str(raw)
            .map_err(|e| PortError::Validation(format!("wallet file is not valid json: {e}")))?;
        if file.version != WALLET_FILE_VERSION {
            return Err(PortError::Validation(format!(
                "unsupported wallet file version {}",
                file.version
            )));
        }
        let address = file.sender()?;
        if !address.is_for_network(file.network) {
            return Err(PortError::Validation(format!(
                "wallet address {address} is not a {:?} address",
                file.network
            )));
        }
        if file.wallet_type == WalletType::Software && file.encrypted_key.is_none() {
            return Err(PortError::Validation(
                "software wallet file has no encrypted key".to_owned(),
            ));
        }
        Ok(file)
    }

    pub fn to_json(&self) -> Result<String, PortError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PortError::Validation(format!("wallet file serialization failed: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, PortError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PortError::NotFound(format!("cannot read wallet file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: &Path) -> Result<(), PortError> {
        std::fs::write(path, self.to_json()?).map_err(|e| {
            PortError::Transport(format!("cannot write wallet file {}: {e}", path.display()))
        })
    }

    pub fn sender(&self) -> Result<StacksAddress, PortError> {
        self.address
            .parse()
            .map_err(|e| PortError::Validation(format!("invalid wallet address: {e}")))
    }

    pub fn encrypted_wallet(&self) -> Result<Option<EncryptedWallet>, PortError> {
        let Some(record) = &self.encrypted_key else {
            return Ok(None);
        };
        Ok(Some(EncryptedWallet {
            kdf_algorithm: record.kdf_algorithm,
            salt: decode_fixed(&record.salt, "salt")?,
            nonce: decode_fixed(&record.nonce, "nonce")?,
            ciphertext: decode(&record.ciphertext, "ciphertext")?,
        }))
    }
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, PortError> {
    BASE64
        .decode(value)
        .map_err(|e| PortError::Validation(format!("invalid base64 in {field}: {e}")))
}

fn decode_fixed<const N: usize>(value: &str, field: &str) -> Result<[u8; N], PortError> {
    let bytes = decode(value, field)?;
    bytes.as_slice().try_into().map_err(|_| {
        PortError::Validation(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

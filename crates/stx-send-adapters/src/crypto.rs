use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::{debug, warn};

use stx_send_core::domain::{EncryptedWallet, KdfAlgorithm, SenderKey};
use stx_send_core::{KeyVaultPort, PortError};

const WALLET_KEY_INFO: &[u8] = b"stx_wallet_key_v1";

/// Password hashing cost. Defaults match interactive-unlock guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub pbkdf2_rounds: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 65_536,
            argon2_iterations: 3,
            pbkdf2_rounds: 600_000,
        }
    }
}

pub fn generate_salt() -> Result<[u8; 16], PortError> {
    let mut salt = [0u8; 16];
    getrandom::getrandom(&mut salt)
        .map_err(|e| PortError::Transport(format!("salt generation failed: {e}")))?;
    Ok(salt)
}

pub fn generate_nonce() -> Result<[u8; 12], PortError> {
    let mut nonce = [0u8; 12];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| PortError::Transport(format!("nonce generation failed: {e}")))?;
    Ok(nonce)
}

/// Password -> AES key for the algorithm recorded with the wallet.
pub fn derive_wallet_key(
    passphrase: &[u8],
    salt: &[u8; 16],
    algorithm: KdfAlgorithm,
    params: &KdfParams,
) -> Result<[u8; 32], PortError> {
    let mut root = [0u8; 32];
    match algorithm {
        KdfAlgorithm::Argon2idV1 => {
            let params = Params::new(params.argon2_memory_kib, params.argon2_iterations, 1, Some(32))
                .map_err(|e| PortError::Validation(format!("argon2 params rejected: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(passphrase, salt, &mut root)
                .map_err(|e| PortError::Validation(format!("argon2 derivation failed: {e}")))?;
        }
        KdfAlgorithm::Pbkdf2HmacSha256V1 => {
            pbkdf2_hmac::<Sha256>(passphrase, salt, params.pbkdf2_rounds, &mut root);
        }
    }
    let hk = Hkdf::<Sha256>::new(None, &root);
    let mut key = [0u8; 32];
    hk.expand(WALLET_KEY_INFO, &mut key)
        .map_err(|_| PortError::Validation("hkdf expand for wallet key failed".to_owned()))?;
    Ok(key)
}

pub fn encrypt_aes_gcm(
    enc_key: &[u8; 32],
    nonce: [u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, PortError> {
    let cipher = Aes256Gcm::new_from_slice(enc_key)
        .map_err(|e| PortError::Validation(format!("aes-gcm init failed: {e}")))?;
    let nonce = Nonce::<aes_gcm::aead::consts::U12>::from(nonce);
    cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| PortError::Transport(format!("aes-gcm encrypt failed: {e}")))
}

pub fn decrypt_aes_gcm(
    enc_key: &[u8; 32],
    nonce: [u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, PortError> {
    let cipher = Aes256Gcm::new_from_slice(enc_key)
        .map_err(|e| PortError::Validation(format!("aes-gcm init failed: {e}")))?;
    let nonce = Nonce::<aes_gcm::aead::consts::U12>::from(nonce);
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|e| PortError::Validation(format!("aes-gcm decrypt failed: {e}")))
}

/// Accepts a raw 32-byte secret or the 33-byte compressed-flag form (`.. || 0x01`).
pub fn sender_key_from_bytes(bytes: &[u8]) -> Result<SenderKey, PortError> {
    let secret = match bytes.len() {
        32 => bytes,
        33 if bytes[32] == 0x01 => &bytes[..32],
        n => {
            return Err(PortError::Validation(format!(
                "private key must be 32 or 33 bytes, got {n}"
            )))
        }
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(secret);
    Ok(SenderKey(key))
}

/// Password-protected storage for a software wallet's private key.
#[derive(Debug, Clone, Default)]
pub struct SoftwareKeyVault {
    params: KdfParams,
}

impl SoftwareKeyVault {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn encrypt_key(&self, key: &SenderKey, password: &str) -> Result<EncryptedWallet, PortError> {
        if password.is_empty() {
            return Err(PortError::Validation("password must not be empty".to_owned()));
        }
        let salt = generate_salt()?;
        let nonce = generate_nonce()?;
        let (enc_key, kdf_algorithm) = self.derive_for_new_wallet(password.as_bytes(), &salt)?;
        let ciphertext = encrypt_aes_gcm(&enc_key, nonce, &key.0)?;
        Ok(EncryptedWallet {
            kdf_algorithm,
            salt,
            nonce,
            ciphertext,
        })
    }

    // Argon2id first, PBKDF2 when argon2 cannot run with these params.
    fn derive_for_new_wallet(
        &self,
        passphrase: &[u8],
        salt: &[u8; 16],
    ) -> Result<([u8; 32], KdfAlgorithm), PortError> {
        match derive_wallet_key(passphrase, salt, KdfAlgorithm::Argon2idV1, &self.params) {
            Ok(key) => Ok((key, KdfAlgorithm::Argon2idV1)),
            Err(e) => {
                warn!(error = %e, "argon2 unavailable, falling back to pbkdf2");
                let key = derive_wallet_key(
                    passphrase,
                    salt,
                    KdfAlgorithm::Pbkdf2HmacSha256V1,
                    &self.params,
                )?;
                Ok((key, KdfAlgorithm::Pbkdf2HmacSha256V1))
            }
        }
    }
}

impl KeyVaultPort for SoftwareKeyVault {
    fn decrypt_software_wallet(
        &self,
        wallet: &EncryptedWallet,
        password: &str,
    ) -> Result<SenderKey, PortError> {
        debug!(kdf = ?wallet.kdf_algorithm, "unlocking software wallet");
        let enc_key = derive_wallet_key(
            password.as_bytes(),
            &wallet.salt,
            wallet.kdf_algorithm,
            &self.params,
        )?;
        let plaintext = decrypt_aes_gcm(&enc_key, wallet.nonce, &wallet.ciphertext)?;
        sender_key_from_bytes(&plaintext)
    }
}

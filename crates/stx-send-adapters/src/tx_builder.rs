use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use tracing::trace;

use stx_send_core::domain::{MessageSignature, PublicKeyBytes, SenderKey, TransferParams};
use stx_send_core::{Network, PortError, SignedTransaction, StacksAddress, StacksTransaction, TransactionBuilderPort};

/// Well-known throwaway key used only to size transactions for fee estimation.
pub const FEE_ESTIMATION_KEY: [u8; 32] = [
    0xf0, 0xbc, 0x18, 0xb8, 0xc5, 0xad, 0xc3, 0x9c, 0x26, 0xe0, 0xfe, 0x68, 0x6c, 0x71, 0xc7, 0xab,
    0x3c, 0xc1, 0x75, 0x5a, 0x3a, 0x19, 0xe6, 0xe1, 0xeb, 0x84, 0xb5, 0x5f, 0x2e, 0xde, 0x95, 0xda,
];

pub fn hash160(bytes: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(bytes)).into()
}

fn signing_key(key: &SenderKey) -> Result<SigningKey, PortError> {
    SigningKey::from_slice(&key.0)
        .map_err(|e| PortError::Validation(format!("invalid secp256k1 private key: {e}")))
}

pub fn public_key_of(key: &SenderKey) -> Result<PublicKeyBytes, PortError> {
    let verifying = *signing_key(key)?.verifying_key();
    PublicKeyBytes::from_slice(verifying.to_encoded_point(true).as_bytes())
}

pub fn address_for(network: Network, public_key: &PublicKeyBytes) -> Result<StacksAddress, PortError> {
    StacksAddress::new(network.single_sig_version(), hash160(&public_key.0))
        .map_err(|e| PortError::Validation(e.to_string()))
}

/// Recoverable signature over `digest` in `recovery_id || r || s` form.
pub fn sign_digest(key: &SenderKey, digest: &[u8; 32]) -> Result<MessageSignature, PortError> {
    let (signature, recovery_id) = signing_key(key)?
        .sign_prehash_recoverable(digest)
        .map_err(|e| PortError::Validation(format!("secp256k1 signing failed: {e}")))?;
    let mut out = [0u8; 65];
    out[0] = recovery_id.to_byte();
    out[1..].copy_from_slice(&signature.to_bytes());
    Ok(MessageSignature(out))
}

/// Recovers the compressed public key that produced the transaction's signature.
pub fn recover_signer(tx: &StacksTransaction) -> Result<PublicKeyBytes, PortError> {
    let raw = &tx.spending_condition.signature.0;
    let recovery_id = RecoveryId::from_byte(raw[0])
        .ok_or_else(|| PortError::Validation(format!("invalid recovery id {}", raw[0])))?;
    let signature = Signature::from_slice(&raw[1..])
        .map_err(|e| PortError::Validation(format!("malformed signature: {e}")))?;
    let verifying = VerifyingKey::recover_from_prehash(&tx.presign_sighash(), &signature, recovery_id)
        .map_err(|e| PortError::Validation(format!("signature does not recover: {e}")))?;
    PublicKeyBytes::from_slice(verifying.to_encoded_point(true).as_bytes())
}

/// Builds single-sig token transfers. Fees are `fee_rate` µSTX per serialized byte.
#[derive(Debug, Clone)]
pub struct StacksTransactionBuilder {
    fee_rate: u64,
}

impl StacksTransactionBuilder {
    pub fn new(fee_rate: u64) -> Self {
        Self { fee_rate }
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    fn build(&self, params: &TransferParams, signer: [u8; 20]) -> Result<StacksTransaction, PortError> {
        let mut tx = StacksTransaction::new_token_transfer(
            params.network,
            signer,
            params.nonce,
            0,
            params.recipient,
            params.amount,
            &params.memo,
        )?;
        let fee = match params.fee {
            Some(fee) => fee,
            None => {
                let len = tx.serialize().len() as u64;
                self.fee_rate.saturating_mul(len)
            }
        };
        tx.set_fee(fee);
        trace!(fee, nonce = params.nonce, "built transfer");
        Ok(tx)
    }
}

impl TransactionBuilderPort for StacksTransactionBuilder {
    fn estimate_fee(&self, params: &TransferParams) -> Result<u64, PortError> {
        let placeholder = SenderKey(FEE_ESTIMATION_KEY);
        let estimate = TransferParams {
            fee: None,
            ..params.clone()
        };
        let signed = self.make_signed_transfer(&estimate, &placeholder)?;
        Ok(signed.transaction().fee())
    }

    fn make_signed_transfer(
        &self,
        params: &TransferParams,
        sender_key: &SenderKey,
    ) -> Result<SignedTransaction, PortError> {
        let public_key = public_key_of(sender_key)?;
        let mut tx = self.build(params, hash160(&public_key.0))?;
        let signature = sign_digest(sender_key, &tx.presign_sighash())?;
        tx.set_signature(signature);
        SignedTransaction::new(tx)
    }

    fn make_unsigned_transfer(
        &self,
        params: &TransferParams,
        public_key: &PublicKeyBytes,
    ) -> Result<StacksTransaction, PortError> {
        self.build(params, hash160(&public_key.0))
    }
}

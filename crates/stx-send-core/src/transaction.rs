//! Single-sig STX token-transfer transactions and their wire encoding.

use sha2::{Digest, Sha512_256};

use crate::address::{Network, StacksAddress};
use crate::domain::MessageSignature;
use crate::ports::PortError;

pub const MEMO_LEN: usize = 34;

const AUTH_STANDARD: u8 = 0x04;
const HASH_MODE_P2PKH: u8 = 0x00;
const KEY_ENCODING_COMPRESSED: u8 = 0x00;
const ANCHOR_MODE_ANY: u8 = 0x03;
const POST_CONDITION_MODE_DENY: u8 = 0x02;
const PAYLOAD_TOKEN_TRANSFER: u8 = 0x00;
const PRINCIPAL_STANDARD: u8 = 0x05;

/// The authorization field: who pays, at which nonce/fee, and their signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingCondition {
    pub signer: [u8; 20],
    pub nonce: u64,
    pub fee: u64,
    pub signature: MessageSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferPayload {
    pub recipient: StacksAddress,
    pub amount: u64,
    pub memo: [u8; MEMO_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StacksTransaction {
    pub network: Network,
    pub spending_condition: SpendingCondition,
    pub payload: TokenTransferPayload,
}

impl StacksTransaction {
    pub fn new_token_transfer(
        network: Network,
        signer: [u8; 20],
        nonce: u64,
        fee: u64,
        recipient: StacksAddress,
        amount: u64,
        memo: &str,
    ) -> Result<Self, PortError> {
        let memo_bytes = memo.as_bytes();
        if memo_bytes.len() > MEMO_LEN {
            return Err(PortError::Validation(format!(
                "memo exceeds {MEMO_LEN} bytes"
            )));
        }
        let mut memo_field = [0u8; MEMO_LEN];
        memo_field[..memo_bytes.len()].copy_from_slice(memo_bytes);
        Ok(Self {
            network,
            spending_condition: SpendingCondition {
                signer,
                nonce,
                fee,
                signature: MessageSignature::empty(),
            },
            payload: TokenTransferPayload {
                recipient,
                amount,
                memo: memo_field,
            },
        })
    }

    pub fn fee(&self) -> u64 {
        self.spending_condition.fee
    }

    pub fn set_fee(&mut self, fee: u64) {
        self.spending_condition.fee = fee;
    }

    /// Replaces the signature carried by the spending condition.
    pub fn set_signature(&mut self, signature: MessageSignature) {
        self.spending_condition.signature = signature;
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(180);
        out.push(self.network.transaction_version());
        out.extend_from_slice(&self.network.chain_id().to_be_bytes());

        let cond = &self.spending_condition;
        out.push(AUTH_STANDARD);
        out.push(HASH_MODE_P2PKH);
        out.extend_from_slice(&cond.signer);
        out.extend_from_slice(&cond.nonce.to_be_bytes());
        out.extend_from_slice(&cond.fee.to_be_bytes());
        out.push(KEY_ENCODING_COMPRESSED);
        out.extend_from_slice(&cond.signature.0);

        out.push(ANCHOR_MODE_ANY);
        out.push(POST_CONDITION_MODE_DENY);
        out.extend_from_slice(&0u32.to_be_bytes());

        out.push(PAYLOAD_TOKEN_TRANSFER);
        out.push(PRINCIPAL_STANDARD);
        out.push(self.payload.recipient.version);
        out.extend_from_slice(&self.payload.recipient.hash160);
        out.extend_from_slice(&self.payload.amount.to_be_bytes());
        out.extend_from_slice(&self.payload.memo);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, PortError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        let network = Network::for_transaction_version(version).ok_or_else(|| {
            PortError::Validation(format!("unknown transaction version {version:#04x}"))
        })?;
        let chain_id = r.u32()?;
        if chain_id != network.chain_id() {
            return Err(PortError::Validation(format!(
                "chain id {chain_id:#010x} does not match {network:?}"
            )));
        }

        r.expect(AUTH_STANDARD, "auth type")?;
        r.expect(HASH_MODE_P2PKH, "hash mode")?;
        let signer = r.array::<20>()?;
        let nonce = r.u64()?;
        let fee = r.u64()?;
        r.expect(KEY_ENCODING_COMPRESSED, "key encoding")?;
        let signature = MessageSignature(r.array::<65>()?);

        r.expect(ANCHOR_MODE_ANY, "anchor mode")?;
        r.expect(POST_CONDITION_MODE_DENY, "post-condition mode")?;
        if r.u32()? != 0 {
            return Err(PortError::Validation(
                "post conditions are not supported".to_owned(),
            ));
        }

        r.expect(PAYLOAD_TOKEN_TRANSFER, "payload type")?;
        r.expect(PRINCIPAL_STANDARD, "principal type")?;
        let recipient_version = r.u8()?;
        let recipient_hash = r.array::<20>()?;
        let recipient = StacksAddress::new(recipient_version, recipient_hash)
            .map_err(|e| PortError::Validation(format!("invalid recipient: {e}")))?;
        let amount = r.u64()?;
        let memo = r.array::<MEMO_LEN>()?;
        if !r.is_empty() {
            return Err(PortError::Validation(
                "trailing bytes after transaction".to_owned(),
            ));
        }

        Ok(Self {
            network,
            spending_condition: SpendingCondition {
                signer,
                nonce,
                fee,
                signature,
            },
            payload: TokenTransferPayload {
                recipient,
                amount,
                memo,
            },
        })
    }

    pub fn txid(&self) -> [u8; 32] {
        Sha512_256::digest(self.serialize()).into()
    }

    pub fn txid_hex(&self) -> String {
        format!("0x{}", alloy::hex::encode(self.txid()))
    }

    /// txid of the transaction with its authorization cleared.
    pub fn initial_sighash(&self) -> [u8; 32] {
        let mut cleared = self.clone();
        cleared.spending_condition.nonce = 0;
        cleared.spending_condition.fee = 0;
        cleared.spending_condition.signature = MessageSignature::empty();
        cleared.txid()
    }

    /// Digest the sender key signs.
    pub fn presign_sighash(&self) -> [u8; 32] {
        let mut hasher = Sha512_256::new();
        hasher.update(self.initial_sighash());
        hasher.update([AUTH_STANDARD]);
        hasher.update(self.spending_condition.fee.to_be_bytes());
        hasher.update(self.spending_condition.nonce.to_be_bytes());
        hasher.finalize().into()
    }
}

/// A transaction carrying a signature. Consumed by value when broadcast.
#[derive(Debug, PartialEq, Eq)]
pub struct SignedTransaction(StacksTransaction);

impl SignedTransaction {
    pub fn new(tx: StacksTransaction) -> Result<Self, PortError> {
        if tx.spending_condition.signature.is_empty() {
            return Err(PortError::Validation(
                "transaction has no signature".to_owned(),
            ));
        }
        Ok(Self(tx))
    }

    pub fn transaction(&self) -> &StacksTransaction {
        &self.0
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.0.serialize()
    }

    pub fn into_inner(self) -> StacksTransaction {
        self.0
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PortError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| PortError::Validation("transaction truncated".to_owned()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PortError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PortError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PortError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64, PortError> {
        Ok(u64::from_be_bytes(self.array::<8>()?))
    }

    fn expect(&mut self, value: u8, what: &str) -> Result<(), PortError> {
        let got = self.u8()?;
        if got != value {
            return Err(PortError::Validation(format!(
                "unexpected {what}: {got:#04x}"
            )));
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{
    BroadcastReceipt, ConfirmedAddress, DeviceDescriptor, EncryptedWallet, MessageSignature,
    PublicKeyBytes, SenderKey, TransferParams,
};
use crate::transaction::{SignedTransaction, StacksTransaction};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("device error [{code:#06x}] {message}")]
    Device { code: u16, message: String },
    #[error("policy error: {0}")]
    Policy(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Notifications from the HID layer. Listeners see `Attached`; open channels
/// report their own `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Attached(DeviceDescriptor),
    Disconnected(DeviceDescriptor),
}

pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;

/// Active attach subscription. Dropping it unsubscribes.
pub struct ListenerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

pub trait DeviceChannel: Send + 'static {
    fn descriptor(&self) -> &DeviceDescriptor;
    fn exchange(&mut self, apdu: &[u8]) -> Result<Vec<u8>, PortError>;
    fn close(&mut self);
}

pub trait DeviceTransportPort: Send + 'static {
    type Channel: DeviceChannel;

    fn listen(&self, sink: TransportEventSink) -> Result<ListenerHandle, PortError>;
    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        sink: TransportEventSink,
    ) -> Result<Self::Channel, PortError>;
}

pub trait HardwareSignerPort {
    fn confirm_public_key(
        &self,
    ) -> impl Future<Output = Result<ConfirmedAddress, PortError>> + Send;
    fn sign_transaction(
        &self,
        serialized_tx: Vec<u8>,
    ) -> impl Future<Output = Result<MessageSignature, PortError>> + Send;
}

pub trait TransactionBuilderPort {
    fn estimate_fee(&self, params: &TransferParams) -> Result<u64, PortError>;
    fn make_signed_transfer(
        &self,
        params: &TransferParams,
        sender_key: &SenderKey,
    ) -> Result<SignedTransaction, PortError>;
    fn make_unsigned_transfer(
        &self,
        params: &TransferParams,
        public_key: &PublicKeyBytes,
    ) -> Result<StacksTransaction, PortError>;
}

pub trait KeyVaultPort {
    fn decrypt_software_wallet(
        &self,
        wallet: &EncryptedWallet,
        password: &str,
    ) -> Result<SenderKey, PortError>;
}

pub trait BroadcastPort {
    fn broadcast(
        &self,
        tx: SignedTransaction,
        amount: u64,
    ) -> impl Future<Output = Result<BroadcastReceipt, PortError>> + Send;
}

pub trait ModalDispatchPort {
    fn close_tx_modal(&self);
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stx_send_core::app::return_code;
use stx_send_core::domain::{
    BroadcastReceipt, DeviceDescriptor, EncryptedWallet, KdfAlgorithm, MessageSignature,
    PublicKeyBytes, SenderKey, TransferParams,
};
use stx_send_core::ports::{ListenerHandle, TransportEvent, TransportEventSink};
use stx_send_core::{
    BroadcastPort, DeviceChannel, DeviceTransportPort, KeyVaultPort, ModalDispatchPort, Network,
    PortError, SignedTransaction, StacksAddress, StacksTransaction, TransactionBuilderPort,
    WalletContext, WalletType,
};

pub const SENDER: &str = "STG2081040G2081040G2081040G2081066TB8XK";
pub const RECIPIENT: &str = "ST1040G2081040G2081040G2081040G209PGXK8S";
pub const MAINNET_RECIPIENT: &str = "SP1040G2081040G2081040G2081040G20ABNMJC0";

pub const PASSWORD: &str = "correct horse";
pub const ESTIMATED_FEE: u64 = 180;
pub const DEVICE_SIGNATURE: [u8; 65] = [0x42; 65];
pub const SOFTWARE_SIGNATURE: [u8; 65] = [0x07; 65];
pub const DEVICE_PUBLIC_KEY: [u8; 33] = [0x02; 33];

pub fn address(s: &str) -> StacksAddress {
    s.parse().expect("valid test address")
}

pub fn wallet_context(wallet_type: WalletType, balance: u64) -> WalletContext {
    WalletContext {
        wallet_type,
        network: Network::Testnet,
        sender: address(SENDER),
        balance,
        nonce: 4,
        encrypted_wallet: Some(EncryptedWallet {
            kdf_algorithm: KdfAlgorithm::Argon2idV1,
            salt: [1u8; 16],
            nonce: [2u8; 12],
            ciphertext: vec![3u8; 48],
        }),
    }
}

/// Lets spawned tasks drain their queues without advancing the clock.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[derive(Default)]
struct Hub {
    next_listener: u64,
    listeners: HashMap<u64, TransportEventSink>,
    device: Option<DeviceDescriptor>,
    channel_sink: Option<TransportEventSink>,
    app_open: bool,
    reject_next_sign: bool,
    fail_next_open: bool,
    status_override: Option<u16>,
    sign_gate: Option<std_mpsc::Receiver<()>>,
    opens: usize,
    open_failures: usize,
    version_queries: usize,
    sign_requests: usize,
}

/// In-memory HID transport with a scriptable Stacks app.
#[derive(Clone, Default)]
pub struct FakeTransport {
    hub: Arc<Mutex<Hub>>,
}

impl FakeTransport {
    fn with_hub<R>(&self, f: impl FnOnce(&mut Hub) -> R) -> R {
        let mut hub = self.hub.lock().expect("hub lock");
        f(&mut hub)
    }

    pub fn attach(&self, name: &str) {
        self.with_hub(|hub| {
            let descriptor = DeviceDescriptor::from(name);
            hub.device = Some(descriptor.clone());
            for sink in hub.listeners.values() {
                let _ = sink.send(TransportEvent::Attached(descriptor.clone()));
            }
        });
    }

    /// Unplugs the device and notifies the open channel.
    pub fn detach(&self) {
        self.with_hub(|hub| {
            let descriptor = hub.device.take();
            if let (Some(descriptor), Some(sink)) = (descriptor, hub.channel_sink.take()) {
                let _ = sink.send(TransportEvent::Disconnected(descriptor));
            }
        });
    }

    /// Unplugs the device without any notification.
    pub fn detach_silently(&self) {
        self.with_hub(|hub| {
            hub.device = None;
        });
    }

    /// Delivers an attach event through the open channel's sink.
    pub fn stray_attach(&self, name: &str) {
        self.with_hub(|hub| {
            if let Some(sink) = &hub.channel_sink {
                let _ = sink.send(TransportEvent::Attached(DeviceDescriptor::from(name)));
            }
        });
    }

    pub fn set_app_open(&self, open: bool) {
        self.with_hub(|hub| hub.app_open = open);
    }

    pub fn reject_next_sign(&self) {
        self.with_hub(|hub| hub.reject_next_sign = true);
    }

    /// Every version query is answered with `code` until cleared.
    pub fn answer_polls_with(&self, code: Option<u16>) {
        self.with_hub(|hub| hub.status_override = code);
    }

    /// The next final sign chunk blocks until the returned sender fires,
    /// like a device waiting on the user's button press.
    pub fn hold_next_sign(&self) -> std_mpsc::Sender<()> {
        let (approve, gate) = std_mpsc::channel();
        self.with_hub(|hub| hub.sign_gate = Some(gate));
        approve
    }

    pub fn fail_next_open(&self) {
        self.with_hub(|hub| hub.fail_next_open = true);
    }

    pub fn opens(&self) -> usize {
        self.with_hub(|hub| hub.opens)
    }

    pub fn open_failures(&self) -> usize {
        self.with_hub(|hub| hub.open_failures)
    }

    pub fn active_listeners(&self) -> usize {
        self.with_hub(|hub| hub.listeners.len())
    }

    pub fn channel_open(&self) -> bool {
        self.with_hub(|hub| hub.channel_sink.is_some())
    }

    pub fn version_queries(&self) -> usize {
        self.with_hub(|hub| hub.version_queries)
    }

    pub fn sign_requests(&self) -> usize {
        self.with_hub(|hub| hub.sign_requests)
    }
}

impl DeviceTransportPort for FakeTransport {
    type Channel = FakeChannel;

    fn listen(&self, sink: TransportEventSink) -> Result<ListenerHandle, PortError> {
        let id = self.with_hub(|hub| {
            let id = hub.next_listener;
            hub.next_listener += 1;
            if let Some(device) = &hub.device {
                let _ = sink.send(TransportEvent::Attached(device.clone()));
            }
            hub.listeners.insert(id, sink);
            id
        });
        let hub = Arc::clone(&self.hub);
        Ok(ListenerHandle::new(move || {
            if let Ok(mut hub) = hub.lock() {
                hub.listeners.remove(&id);
            }
        }))
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        sink: TransportEventSink,
    ) -> Result<FakeChannel, PortError> {
        self.with_hub(|hub| {
            if hub.fail_next_open {
                hub.fail_next_open = false;
                hub.open_failures += 1;
                return Err(PortError::Transport("cannot open device".to_owned()));
            }
            if hub.device.as_ref() != Some(descriptor) {
                return Err(PortError::NotFound(descriptor.to_string()));
            }
            hub.opens += 1;
            hub.channel_sink = Some(sink);
            Ok(())
        })?;
        Ok(FakeChannel {
            descriptor: descriptor.clone(),
            hub: Arc::clone(&self.hub),
        })
    }
}

pub struct FakeChannel {
    descriptor: DeviceDescriptor,
    hub: Arc<Mutex<Hub>>,
}

fn with_code(mut payload: Vec<u8>, code: u16) -> Vec<u8> {
    payload.extend_from_slice(&code.to_be_bytes());
    payload
}

impl DeviceChannel for FakeChannel {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn exchange(&mut self, apdu: &[u8]) -> Result<Vec<u8>, PortError> {
        if apdu[1] == 0x02 && apdu[2] == 0x02 {
            let gate = self.hub.lock().expect("hub lock").sign_gate.take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
        }
        let mut hub = self.hub.lock().expect("hub lock");
        if hub.device.as_ref() != Some(&self.descriptor) {
            return Err(PortError::Disconnected(self.descriptor.to_string()));
        }
        let (ins, p1) = (apdu[1], apdu[2]);
        if ins == 0x00 {
            hub.version_queries += 1;
            if let Some(code) = hub.status_override {
                return Ok(with_code(Vec::new(), code));
            }
        }
        if !hub.app_open {
            return Ok(with_code(Vec::new(), return_code::APP_NOT_OPEN));
        }
        let response = match ins {
            0x00 => with_code(vec![0, 0, 4, 1, 0], return_code::NO_ERROR),
            0x01 => {
                let mut payload = DEVICE_PUBLIC_KEY.to_vec();
                payload.extend_from_slice(SENDER.as_bytes());
                with_code(payload, return_code::NO_ERROR)
            }
            0x02 if p1 == 0x02 => {
                hub.sign_requests += 1;
                if hub.reject_next_sign {
                    hub.reject_next_sign = false;
                    with_code(Vec::new(), return_code::TRANSACTION_REJECTED)
                } else {
                    let mut payload = vec![0u8; 32];
                    payload.extend_from_slice(&DEVICE_SIGNATURE);
                    with_code(payload, return_code::NO_ERROR)
                }
            }
            0x02 => with_code(Vec::new(), return_code::NO_ERROR),
            _ => with_code(Vec::new(), return_code::INS_NOT_SUPPORTED),
        };
        Ok(response)
    }

    fn close(&mut self) {
        if let Ok(mut hub) = self.hub.lock() {
            hub.channel_sink = None;
        }
    }
}

pub struct FakeVault;

impl KeyVaultPort for FakeVault {
    fn decrypt_software_wallet(
        &self,
        _wallet: &EncryptedWallet,
        password: &str,
    ) -> Result<SenderKey, PortError> {
        if password == PASSWORD {
            Ok(SenderKey([9u8; 32]))
        } else {
            Err(PortError::Validation("aead tag mismatch".to_owned()))
        }
    }
}

/// Builds real transfers with fixed signatures. Fee defaults to `ESTIMATED_FEE`.
pub struct FakeBuilder;

impl FakeBuilder {
    fn transfer(params: &TransferParams, signer: [u8; 20]) -> Result<StacksTransaction, PortError> {
        StacksTransaction::new_token_transfer(
            params.network,
            signer,
            params.nonce,
            params.fee.unwrap_or(ESTIMATED_FEE),
            params.recipient,
            params.amount,
            &params.memo,
        )
    }
}

impl TransactionBuilderPort for FakeBuilder {
    fn estimate_fee(&self, params: &TransferParams) -> Result<u64, PortError> {
        Ok(params.fee.unwrap_or(ESTIMATED_FEE))
    }

    fn make_signed_transfer(
        &self,
        params: &TransferParams,
        _sender_key: &SenderKey,
    ) -> Result<SignedTransaction, PortError> {
        let mut tx = Self::transfer(params, address(SENDER).hash160)?;
        tx.set_signature(MessageSignature(SOFTWARE_SIGNATURE));
        SignedTransaction::new(tx)
    }

    fn make_unsigned_transfer(
        &self,
        params: &TransferParams,
        public_key: &PublicKeyBytes,
    ) -> Result<StacksTransaction, PortError> {
        let mut signer = [0u8; 20];
        signer.copy_from_slice(&public_key.0[..20]);
        Self::transfer(params, signer)
    }
}

#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    pub sent: Arc<Mutex<Vec<StacksTransaction>>>,
    pub fail_with: Option<String>,
}

impl RecordingBroadcaster {
    pub fn failing(reason: &str) -> Self {
        Self {
            sent: Arc::default(),
            fail_with: Some(reason.to_owned()),
        }
    }

    pub fn sent(&self) -> Vec<StacksTransaction> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl BroadcastPort for RecordingBroadcaster {
    async fn broadcast(
        &self,
        tx: SignedTransaction,
        amount: u64,
    ) -> Result<BroadcastReceipt, PortError> {
        if let Some(reason) = &self.fail_with {
            return Err(PortError::Transport(reason.clone()));
        }
        let tx = tx.into_inner();
        let receipt = BroadcastReceipt {
            txid: tx.txid_hex(),
            amount,
            fee: tx.fee(),
            total: amount + tx.fee(),
        };
        self.sent.lock().expect("sent lock").push(tx);
        Ok(receipt)
    }
}

#[derive(Clone, Default)]
pub struct CountingDispatch {
    pub closes: Arc<AtomicUsize>,
}

impl CountingDispatch {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ModalDispatchPort for CountingDispatch {
    fn close_tx_modal(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

//! In-memory Ledger hub running an emulated Stacks app.
//!
//! Implements the transport port so the device session can be driven without
//! hardware. Attach/detach and app open/close are scripted by the caller.
//!
//! The device key is a published constant, so anything it signs is spendable
//! by anyone. [`EmulatedLedger::for_config`] refuses to hand one out under the
//! production profile or on mainnet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha512_256};
use tracing::{debug, trace, warn};

use stx_send_core::app::{
    return_code, CLA, INS_GET_ADDR_SECP256K1, INS_GET_VERSION, INS_SIGN_SECP256K1, PAYLOAD_ADD,
    PAYLOAD_INIT, PAYLOAD_LAST,
};
use stx_send_core::domain::{DerivationPath, DeviceDescriptor, PublicKeyBytes, SenderKey};
use stx_send_core::ports::{ListenerHandle, TransportEvent, TransportEventSink};
use stx_send_core::{DeviceChannel, DeviceTransportPort, Network, PortError, StacksTransaction};

use crate::tx_builder::{address_for, public_key_of, sign_digest};
use crate::SendFlowConfig;

pub const EMULATOR_DEVICE_KEY: [u8; 32] = [0x11; 32];
const APP_VERSION: [u8; 4] = [0, 0, 24, 0];
const TARGET_ID: u32 = 0x3110_0004;
const KEY_ENCODING_COMPRESSED: u8 = 0x00;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorCounters {
    pub opens: usize,
    pub active_listeners: usize,
    pub version_queries: usize,
    pub sign_requests: usize,
}

struct EmulatorState {
    network: Network,
    key: SenderKey,
    next_listener: u64,
    listeners: HashMap<u64, TransportEventSink>,
    device: Option<DeviceDescriptor>,
    next_channel: u64,
    // id and disconnect sink of the open channel
    open_channel: Option<(u64, TransportEventSink)>,
    app_open: bool,
    lazy_disconnect: bool,
    reject_next_sign: bool,
    sign_buffer: Option<(DerivationPath, Vec<u8>)>,
    counters: EmulatorCounters,
}

impl EmulatorState {
    fn announce_attach(&self) {
        if let Some(device) = &self.device {
            for sink in self.listeners.values() {
                let _ = sink.send(TransportEvent::Attached(device.clone()));
            }
        }
    }
}

#[derive(Clone)]
pub struct EmulatedLedger {
    state: Arc<Mutex<EmulatorState>>,
}

impl std::fmt::Debug for EmulatedLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedLedger").finish_non_exhaustive()
    }
}

impl EmulatedLedger {
    pub fn new(network: Network) -> Self {
        Self::with_key(network, SenderKey(EMULATOR_DEVICE_KEY))
    }

    pub fn with_key(network: Network, key: SenderKey) -> Self {
        Self {
            state: Arc::new(Mutex::new(EmulatorState {
                network,
                key,
                next_listener: 0,
                listeners: HashMap::new(),
                device: None,
                next_channel: 0,
                open_channel: None,
                app_open: false,
                lazy_disconnect: false,
                reject_next_sign: false,
                sign_buffer: None,
                counters: EmulatorCounters::default(),
            })),
        }
    }

    /// Emulator for `network`, allowed only in development on testnet.
    pub fn for_config(config: &SendFlowConfig, network: Network) -> Result<Self, PortError> {
        if config.strict_runtime_required() {
            return Err(PortError::Policy(
                "emulated ledger is not available in production runtime profile".to_owned(),
            ));
        }
        if network == Network::Mainnet {
            return Err(PortError::Policy(
                "emulated ledger signs with a public key and is refused on mainnet".to_owned(),
            ));
        }
        warn!("using emulated ledger device, its key is public");
        Ok(Self::new(network))
    }

    fn lock(&self) -> Result<MutexGuard<'_, EmulatorState>, PortError> {
        lock(&self.state)
    }

    /// Plugs the device in and notifies every listener.
    pub fn attach(&self, name: &str) -> Result<(), PortError> {
        let mut state = self.lock()?;
        state.device = Some(DeviceDescriptor::from(name));
        debug!(device = name, "emulator: attach");
        state.announce_attach();
        Ok(())
    }

    /// Unplugs the device. In lazy mode the open channel is not told.
    pub fn detach(&self) -> Result<(), PortError> {
        let mut state = self.lock()?;
        let device = state.device.take();
        state.app_open = false;
        state.sign_buffer = None;
        let sink = state.open_channel.take().map(|(_, sink)| sink);
        debug!(lazy = state.lazy_disconnect, "emulator: detach");
        if state.lazy_disconnect {
            return Ok(());
        }
        if let (Some(device), Some(sink)) = (device, sink) {
            let _ = sink.send(TransportEvent::Disconnected(device));
        }
        Ok(())
    }

    pub fn open_app(&self) -> Result<(), PortError> {
        self.lock()?.app_open = true;
        Ok(())
    }

    pub fn close_app(&self) -> Result<(), PortError> {
        let mut state = self.lock()?;
        state.app_open = false;
        state.sign_buffer = None;
        Ok(())
    }

    pub fn set_lazy_disconnect(&self, lazy: bool) -> Result<(), PortError> {
        self.lock()?.lazy_disconnect = lazy;
        Ok(())
    }

    /// The next completed sign request is refused as if the user pressed reject.
    pub fn reject_next_sign(&self) -> Result<(), PortError> {
        self.lock()?.reject_next_sign = true;
        Ok(())
    }

    pub fn counters(&self) -> Result<EmulatorCounters, PortError> {
        let state = self.lock()?;
        Ok(EmulatorCounters {
            active_listeners: state.listeners.len(),
            ..state.counters
        })
    }

    pub fn public_key(&self) -> Result<PublicKeyBytes, PortError> {
        public_key_of(&self.lock()?.key)
    }
}

impl DeviceTransportPort for EmulatedLedger {
    type Channel = EmulatedChannel;

    fn listen(&self, sink: TransportEventSink) -> Result<ListenerHandle, PortError> {
        let id = {
            let mut state = self.lock()?;
            let id = state.next_listener;
            state.next_listener += 1;
            if let Some(device) = &state.device {
                let _ = sink.send(TransportEvent::Attached(device.clone()));
            }
            state.listeners.insert(id, sink);
            id
        };
        trace!(listener = id, "emulator: listening");
        let state = Arc::clone(&self.state);
        Ok(ListenerHandle::new(move || {
            if let Ok(mut state) = state.lock() {
                state.listeners.remove(&id);
            }
        }))
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        sink: TransportEventSink,
    ) -> Result<EmulatedChannel, PortError> {
        let mut state = self.lock()?;
        if state.device.as_ref() != Some(descriptor) {
            return Err(PortError::NotFound(format!("no device at {descriptor}")));
        }
        if state.open_channel.is_some() {
            return Err(PortError::Transport(format!("{descriptor} is already open")));
        }
        let id = state.next_channel;
        state.next_channel += 1;
        state.open_channel = Some((id, sink));
        state.counters.opens += 1;
        Ok(EmulatedChannel {
            id,
            descriptor: descriptor.clone(),
            state: Arc::clone(&self.state),
            closed: false,
        })
    }
}

pub struct EmulatedChannel {
    id: u64,
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<EmulatorState>>,
    closed: bool,
}

impl DeviceChannel for EmulatedChannel {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn exchange(&mut self, apdu: &[u8]) -> Result<Vec<u8>, PortError> {
        if self.closed {
            return Err(PortError::Transport("channel closed".to_owned()));
        }
        let mut state = lock(&self.state)?;
        let current = state.open_channel.as_ref().map(|(id, _)| *id) == Some(self.id);
        if !current || state.device.as_ref() != Some(&self.descriptor) {
            return Err(PortError::Disconnected(self.descriptor.to_string()));
        }
        if apdu.len() < 5 || usize::from(apdu[4]) != apdu.len() - 5 {
            return Ok(status(return_code::WRONG_LENGTH));
        }
        let (cla, ins, p1) = (apdu[0], apdu[1], apdu[2]);
        let data = &apdu[5..];
        if ins == INS_GET_VERSION {
            state.counters.version_queries += 1;
        }
        if !state.app_open || cla != CLA {
            return Ok(status(return_code::APP_NOT_OPEN));
        }
        let response = match ins {
            INS_GET_VERSION => version_response(),
            INS_GET_ADDR_SECP256K1 => address_response(&state, data)?,
            INS_SIGN_SECP256K1 => sign_chunk(&mut state, p1, data)?,
            _ => status(return_code::INS_NOT_SUPPORTED),
        };
        Ok(response)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Ok(mut state) = self.state.lock() {
            if state.open_channel.as_ref().is_some_and(|(id, _)| *id == self.id) {
                state.open_channel = None;
                state.sign_buffer = None;
            }
        }
    }
}

fn lock(state: &Mutex<EmulatorState>) -> Result<MutexGuard<'_, EmulatorState>, PortError> {
    state
        .lock()
        .map_err(|e| PortError::Transport(format!("emulator lock poisoned: {e}")))
}

fn status(code: u16) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

fn ok(mut payload: Vec<u8>) -> Vec<u8> {
    payload.extend_from_slice(&return_code::NO_ERROR.to_be_bytes());
    payload
}

fn version_response() -> Vec<u8> {
    let mut payload = APP_VERSION.to_vec();
    payload.push(0);
    payload.extend_from_slice(&TARGET_ID.to_be_bytes());
    ok(payload)
}

fn address_response(state: &EmulatorState, data: &[u8]) -> Result<Vec<u8>, PortError> {
    if DerivationPath::from_device_bytes(data).is_err() {
        return Ok(status(return_code::DATA_INVALID));
    }
    let public_key = public_key_of(&state.key)?;
    let address = address_for(state.network, &public_key)?;
    let mut payload = public_key.0.to_vec();
    payload.extend_from_slice(address.to_string().as_bytes());
    Ok(ok(payload))
}

fn sign_chunk(state: &mut EmulatorState, p1: u8, data: &[u8]) -> Result<Vec<u8>, PortError> {
    match p1 {
        PAYLOAD_INIT => match DerivationPath::from_device_bytes(data) {
            Ok(path) => {
                state.sign_buffer = Some((path, Vec::new()));
                Ok(ok(Vec::new()))
            }
            Err(_) => Ok(status(return_code::DATA_INVALID)),
        },
        PAYLOAD_ADD | PAYLOAD_LAST => {
            let Some((_, buffer)) = state.sign_buffer.as_mut() else {
                return Ok(status(return_code::CONDITIONS_NOT_SATISFIED));
            };
            buffer.extend_from_slice(data);
            if p1 == PAYLOAD_ADD {
                return Ok(ok(Vec::new()));
            }
            let Some((_, message)) = state.sign_buffer.take() else {
                return Ok(status(return_code::CONDITIONS_NOT_SATISFIED));
            };
            state.counters.sign_requests += 1;
            if state.reject_next_sign {
                state.reject_next_sign = false;
                debug!("emulator: user rejected transaction");
                return Ok(status(return_code::TRANSACTION_REJECTED));
            }
            let Ok(tx) = StacksTransaction::deserialize(&message) else {
                return Ok(status(return_code::DATA_INVALID));
            };
            let presign = tx.presign_sighash();
            let signature = sign_digest(&state.key, &presign)?;
            let mut post_sign = Sha512_256::new();
            post_sign.update(presign);
            post_sign.update([KEY_ENCODING_COMPRESSED]);
            post_sign.update(signature.0);
            let der = k256::ecdsa::Signature::from_slice(&signature.0[1..])
                .map(|sig| sig.to_der().as_bytes().to_vec())
                .unwrap_or_default();

            let mut payload = post_sign.finalize().to_vec();
            payload.extend_from_slice(&signature.0);
            payload.extend_from_slice(&der);
            Ok(ok(payload))
        }
        _ => Ok(status(return_code::INVALID_P1_P2)),
    }
}

//! Client for the Stacks application on a Ledger device.
//!
//! Requests are APDUs `CLA INS P1 P2 LC DATA`; every response ends with a
//! big-endian u16 return code.

use tracing::{debug, trace};

use crate::domain::{AppVersion, ConfirmedAddress, DerivationPath, MessageSignature, PublicKeyBytes};
use crate::ports::{DeviceChannel, PortError};

pub const CLA: u8 = 0x09;
pub const INS_GET_VERSION: u8 = 0x00;
pub const INS_GET_ADDR_SECP256K1: u8 = 0x01;
pub const INS_SIGN_SECP256K1: u8 = 0x02;

pub const P1_ONLY_RETRIEVE: u8 = 0x00;
pub const P1_SHOW_ADDRESS_IN_DEVICE: u8 = 0x01;

pub const PAYLOAD_INIT: u8 = 0x00;
pub const PAYLOAD_ADD: u8 = 0x01;
pub const PAYLOAD_LAST: u8 = 0x02;

pub const CHUNK_SIZE: usize = 250;

pub mod return_code {
    pub const NO_ERROR: u16 = 0x9000;
    pub const EXECUTION_ERROR: u16 = 0x6400;
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const EMPTY_BUFFER: u16 = 0x6982;
    pub const OUTPUT_BUFFER_TOO_SMALL: u16 = 0x6983;
    pub const DATA_INVALID: u16 = 0x6984;
    pub const CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
    pub const TRANSACTION_REJECTED: u16 = 0x6986;
    pub const BAD_KEY_HANDLE: u16 = 0x6A80;
    pub const INVALID_P1_P2: u16 = 0x6B00;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const APP_NOT_OPEN: u16 = 0x6E00;
    pub const UNKNOWN_ERROR: u16 = 0x6F00;
    pub const SIGN_VERIFY_ERROR: u16 = 0x6F01;
}

pub fn return_code_message(code: u16) -> &'static str {
    match code {
        return_code::NO_ERROR => "No errors",
        return_code::EXECUTION_ERROR => "Execution Error",
        return_code::WRONG_LENGTH => "Wrong Length",
        return_code::EMPTY_BUFFER => "Empty Buffer",
        return_code::OUTPUT_BUFFER_TOO_SMALL => "Output buffer too small",
        return_code::DATA_INVALID => "Data is invalid",
        return_code::CONDITIONS_NOT_SATISFIED => "Conditions not satisfied",
        return_code::TRANSACTION_REJECTED => "Transaction rejected",
        return_code::BAD_KEY_HANDLE => "Bad key handle",
        return_code::INVALID_P1_P2 => "Invalid P1/P2",
        return_code::INS_NOT_SUPPORTED => "Instruction not supported",
        return_code::APP_NOT_OPEN => "App does not seem to be open",
        return_code::UNKNOWN_ERROR => "Unknown error",
        return_code::SIGN_VERIFY_ERROR => "Sign/verify error",
        _ => "Unknown Return Code",
    }
}

/// Decoded device reply. `data` is only present when `return_code` is `NO_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppResponse<T> {
    pub return_code: u16,
    pub error_message: &'static str,
    pub data: Option<T>,
}

impl<T> AppResponse<T> {
    fn failed(return_code: u16) -> Self {
        Self {
            return_code,
            error_message: return_code_message(return_code),
            data: None,
        }
    }

    fn ok(data: T) -> Self {
        Self {
            return_code: return_code::NO_ERROR,
            error_message: return_code_message(return_code::NO_ERROR),
            data: Some(data),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == return_code::NO_ERROR
    }

    /// Converts a non-success code into `PortError::Device`.
    pub fn into_result(self) -> Result<T, PortError> {
        match self.data {
            Some(data) if self.return_code == return_code::NO_ERROR => Ok(data),
            _ => Err(PortError::Device {
                code: self.return_code,
                message: self.error_message.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignResponse {
    pub post_sign_hash: [u8; 32],
    pub signature_compact: MessageSignature,
    pub signature_der: Vec<u8>,
}

pub fn encode_apdu(ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<Vec<u8>, PortError> {
    let lc = u8::try_from(data.len()).map_err(|_| {
        PortError::Validation(format!("apdu payload too large: {} bytes", data.len()))
    })?;
    let mut out = Vec::with_capacity(5 + data.len());
    out.extend_from_slice(&[CLA, ins, p1, p2, lc]);
    out.extend_from_slice(data);
    Ok(out)
}

/// Splits a response into payload and return code.
pub fn split_return_code(response: &[u8]) -> Result<(&[u8], u16), PortError> {
    if response.len() < 2 {
        return Err(PortError::Transport(format!(
            "device response too short: {} bytes",
            response.len()
        )));
    }
    let (payload, code) = response.split_at(response.len() - 2);
    Ok((payload, u16::from_be_bytes([code[0], code[1]])))
}

pub struct StacksApp<C> {
    channel: C,
}

impl<C: DeviceChannel> StacksApp<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn get_version(&mut self) -> Result<AppResponse<AppVersion>, PortError> {
        let response = self.send(INS_GET_VERSION, 0, 0, &[])?;
        let (payload, code) = split_return_code(&response)?;
        if code != return_code::NO_ERROR {
            return Ok(AppResponse::failed(code));
        }
        if payload.len() < 5 {
            return Err(PortError::Transport(format!(
                "version payload too short: {} bytes",
                payload.len()
            )));
        }
        let target_id = payload
            .get(5..9)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        Ok(AppResponse::ok(AppVersion {
            test_mode: payload[0] != 0,
            major: payload[1],
            minor: payload[2],
            patch: payload[3],
            device_locked: payload[4] == 1,
            target_id,
        }))
    }

    /// Asks the device to display the address for `path` and return its public key.
    pub fn show_address_and_pubkey(
        &mut self,
        path: &DerivationPath,
    ) -> Result<AppResponse<ConfirmedAddress>, PortError> {
        let serialized = path.serialize_for_device()?;
        let response = self.send(
            INS_GET_ADDR_SECP256K1,
            P1_SHOW_ADDRESS_IN_DEVICE,
            0,
            &serialized,
        )?;
        let (payload, code) = split_return_code(&response)?;
        if code != return_code::NO_ERROR {
            return Ok(AppResponse::failed(code));
        }
        if payload.len() < 33 {
            return Err(PortError::Transport(format!(
                "address payload too short: {} bytes",
                payload.len()
            )));
        }
        let public_key = PublicKeyBytes::from_slice(&payload[..33])?;
        let address = String::from_utf8(payload[33..].to_vec())
            .map_err(|e| PortError::Transport(format!("device address is not utf-8: {e}")))?;
        Ok(AppResponse::ok(ConfirmedAddress {
            public_key,
            address,
        }))
    }

    /// Streams `message` to the device in chunks and returns its signature.
    pub fn sign(
        &mut self,
        path: &DerivationPath,
        message: &[u8],
    ) -> Result<AppResponse<SignResponse>, PortError> {
        let mut chunks = vec![path.serialize_for_device()?];
        chunks.extend(message.chunks(CHUNK_SIZE).map(<[u8]>::to_vec));
        let last = chunks.len() - 1;

        let mut response = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let payload_type = if idx == 0 {
                PAYLOAD_INIT
            } else if idx == last {
                PAYLOAD_LAST
            } else {
                PAYLOAD_ADD
            };
            response = self.send(INS_SIGN_SECP256K1, payload_type, 0, chunk)?;
            let (_, code) = split_return_code(&response)?;
            if code != return_code::NO_ERROR {
                debug!(chunk = idx, code, "sign chunk refused");
                return Ok(AppResponse::failed(code));
            }
        }

        let (payload, _) = split_return_code(&response)?;
        if payload.len() < 32 + 65 {
            return Err(PortError::Transport(format!(
                "sign payload too short: {} bytes",
                payload.len()
            )));
        }
        let mut post_sign_hash = [0u8; 32];
        post_sign_hash.copy_from_slice(&payload[..32]);
        Ok(AppResponse::ok(SignResponse {
            post_sign_hash,
            signature_compact: MessageSignature::from_slice(&payload[32..97])?,
            signature_der: payload[97..].to_vec(),
        }))
    }

    fn send(&mut self, ins: u8, p1: u8, p2: u8, data: &[u8]) -> Result<Vec<u8>, PortError> {
        let apdu = encode_apdu(ins, p1, p2, data)?;
        trace!(ins, p1, len = data.len(), "apdu ->");
        self.channel.exchange(&apdu)
    }
}

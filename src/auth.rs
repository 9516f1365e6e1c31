use std::{fmt, time::Duration};

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128,
};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, warn};

use crate::{
    codec,
    error::{BandError, Result},
    protocol::{bt_uuid, CHAR_AUTH},
    transport::Transport,
};

/// Opcode prefix of the key frame
const OP_SEND_KEY: [u8; 2] = [0x01, 0x00];
/// Opcode prefix of the challenge request frame
const OP_REQUEST_RANDOM: [u8; 2] = [0x02, 0x00];
/// Opcode prefix of the encrypted response frame
const OP_SEND_ENCRYPTED: [u8; 2] = [0x03, 0x00];

/// Handshake exchanges beyond which the device is considered misbehaving
const MAX_EXCHANGES: u32 = 4;

/// 16-byte pre-shared authentication key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthKey([u8; 16]);

impl AuthKey {
    /// Parse a key from its 32-hex-character form
    ///
    /// # Errors
    ///
    /// Returns [`BandError::InvalidAuthKey`] for anything that is not exactly
    /// 32 hex characters.
    pub fn parse(input: &str) -> Result<Self> {
        if input.len() != 32 || !input.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BandError::InvalidAuthKey(format!(
                "expected 32 hex characters, got {} characters",
                input.len()
            )));
        }
        let bytes = codec::hex_to_bytes(input)
            .map_err(|_| BandError::InvalidAuthKey("invalid hex".to_string()))?;
        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Generate a random key for first-time pairing
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex form suitable for storage
    #[must_use]
    pub fn to_hex(&self) -> String {
        codec::bytes_to_hex(&self.0)
    }

    /// AES-128-ECB encrypt a 16-byte challenge under this key
    #[must_use]
    pub fn encrypt_challenge(&self, challenge: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(&self.0));
        let mut block = GenericArray::clone_from_slice(challenge);
        cipher.encrypt_block(&mut block);
        block.into()
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        write!(f, "AuthKey(..)")
    }
}

/// Decoded device reply on the auth characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Key stored, proceed to the challenge request
    KeyAccepted,
    /// Device issued its random challenge
    Challenge([u8; 16]),
    /// Handshake complete
    Success,
    /// Device rejected the key; retrying cannot help
    Rejected,
    /// Response code this crate does not know
    Unknown(u16),
    /// Reply too short to carry a response code
    Malformed,
}

/// Decode one auth-characteristic reply
///
/// The response code is the first two bytes read little-endian. A challenge
/// reply shorter than 18 bytes is malformed.
#[must_use]
pub fn parse_response(data: &[u8]) -> AuthResponse {
    if data.len() < 2 {
        return AuthResponse::Malformed;
    }

    match codec::read_u16_le(data, 0) {
        0x0100 => AuthResponse::KeyAccepted,
        0x0200 => match data.get(2..18) {
            Some(bytes) => {
                let mut challenge = [0u8; 16];
                challenge.copy_from_slice(bytes);
                AuthResponse::Challenge(challenge)
            }
            None => AuthResponse::Malformed,
        },
        0x0300 => AuthResponse::Success,
        0x0301 => AuthResponse::Rejected,
        code => AuthResponse::Unknown(code),
    }
}

/// Build the key frame that opens the handshake
#[must_use]
pub fn send_key_frame(key: &AuthKey) -> [u8; 18] {
    let mut frame = [0u8; 18];
    frame[..2].copy_from_slice(&OP_SEND_KEY);
    frame[2..].copy_from_slice(key.as_bytes());
    frame
}

/// Build the challenge request frame
#[must_use]
pub const fn request_random_frame() -> [u8; 2] {
    OP_REQUEST_RANDOM
}

/// Build the encrypted challenge response frame
#[must_use]
pub fn encrypted_frame(key: &AuthKey, challenge: &[u8; 16]) -> [u8; 18] {
    let mut frame = [0u8; 18];
    frame[..2].copy_from_slice(&OP_SEND_ENCRYPTED);
    frame[2..].copy_from_slice(&key.encrypt_challenge(challenge));
    frame
}

/// Drive the challenge-response handshake to completion
///
/// Writes go to the auth characteristic; replies are taken from `responses`,
/// which the caller feeds from its auth-characteristic subscription. Each
/// exchange is bounded by `step_timeout`.
///
/// # Errors
///
/// Returns [`BandError::AuthenticationFailed`] when the device rejects the
/// key or replies with something the handshake cannot use, and
/// [`BandError::Timeout`] when a reply does not arrive in time.
pub async fn perform(
    transport: &dyn Transport,
    responses: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    key: &AuthKey,
    step_timeout: Duration,
) -> Result<()> {
    let address = transport.address();
    let auth_char = bt_uuid(CHAR_AUTH);

    debug!(address = %address, "starting authentication handshake");
    transport
        .write(auth_char, &send_key_frame(key), false)
        .await?;

    for _ in 0..MAX_EXCHANGES {
        let reply = next_response(responses, step_timeout, &address).await?;

        match parse_response(&reply) {
            AuthResponse::KeyAccepted => {
                transport
                    .write(auth_char, &request_random_frame(), false)
                    .await?;
            }
            AuthResponse::Challenge(challenge) => {
                transport
                    .write(auth_char, &encrypted_frame(key, &challenge), false)
                    .await?;
            }
            AuthResponse::Success => {
                debug!(address = %address, "authentication complete");
                return Ok(());
            }
            AuthResponse::Rejected => {
                warn!(address = %address, "device rejected authentication key");
                return Err(BandError::AuthenticationFailed {
                    address,
                    reason: "rejected by device".to_string(),
                });
            }
            AuthResponse::Unknown(code) => {
                return Err(BandError::AuthenticationFailed {
                    address,
                    reason: format!("unknown response code 0x{code:04x}"),
                });
            }
            AuthResponse::Malformed => {
                return Err(BandError::AuthenticationFailed {
                    address,
                    reason: "malformed response".to_string(),
                });
            }
        }
    }

    Err(BandError::AuthenticationFailed {
        address,
        reason: "handshake did not converge".to_string(),
    })
}

async fn next_response(
    responses: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    step_timeout: Duration,
    address: &str,
) -> Result<Vec<u8>> {
    timeout(step_timeout, responses.recv())
        .await
        .map_err(|_| BandError::Timeout {
            timeout_ms: step_timeout.as_millis() as u64,
        })?
        .ok_or_else(|| BandError::Disconnected {
            address: address.to_string(),
        })
}

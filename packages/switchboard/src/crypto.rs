//! Cryptographic utilities: credential encryption, token hashing, and signed
//! authorization state.

use std::{collections::HashMap, sync::Arc};

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use clients::switchboard::v1::ConnectorType;
use derive_more::{Debug, Display};
use hmac::{
    Hmac, Mac,
    digest::{CtOutput, Output},
};
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::{
    auth::{Caller, OrgId, RawToken, UserId},
    error::BrokerError,
};

pub type HmacSha256 = Hmac<Sha256>;

/// Length of the random nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Length of the AES-GCM authentication tag appended by the cipher.
const TAG_LEN: usize = 16;

/// Identifies which key encrypted a credential.
///
/// Stored next to every ciphertext so that keys can be rotated without
/// re-encrypting everything at once.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Ciphertext together with the id of the key that produced it.
///
/// Layout of `bytes`: 12 byte nonce, then the AES-256-GCM ciphertext and tag.
#[derive(Clone, PartialEq, Eq, Debug)]
#[debug("Sealed(key_id = {}, len = {})", self.key_id, self.bytes.len())]
pub struct Sealed {
    pub key_id: KeyId,
    pub bytes: Vec<u8>,
}

/// Symmetric keys for credential encryption.
///
/// Each key is derived from an operator secret with SHA-256. New data is
/// always sealed with the current key; any key in the ring can open data.
#[derive(Clone, Debug)]
#[debug("Keyring(current = {}, keys = {})", self.current, self.keys.len())]
pub struct Keyring {
    current: KeyId,
    keys: Arc<HashMap<KeyId, Aes256Gcm>>,
}

impl Keyring {
    /// Create a keyring whose current key is derived from `secret`.
    pub fn new(key_id: KeyId, secret: impl AsRef<[u8]>) -> Result<Self, BrokerError> {
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), derive_cipher(secret.as_ref())?);
        Ok(Self {
            current: key_id,
            keys: Arc::new(keys),
        })
    }

    /// Add a retired key that can still open existing ciphertexts.
    pub fn with_previous(
        mut self,
        key_id: KeyId,
        secret: impl AsRef<[u8]>,
    ) -> Result<Self, BrokerError> {
        if key_id == self.current {
            return Err(BrokerError::EncryptionFailure(format!(
                "previous key {key_id} has the same id as the current key"
            )));
        }
        let cipher = derive_cipher(secret.as_ref())?;
        Arc::make_mut(&mut self.keys).insert(key_id, cipher);
        Ok(self)
    }

    /// The id new ciphertexts are sealed under.
    pub fn current_key_id(&self) -> &KeyId {
        &self.current
    }

    /// Encrypt `plaintext` under the current key with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, BrokerError> {
        let cipher = self.cipher(&self.current)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let payload = Payload {
            msg: plaintext,
            aad: self.current.as_str().as_bytes(),
        };
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| BrokerError::EncryptionFailure(String::from("encrypt payload")))?;

        let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);
        Ok(Sealed {
            key_id: self.current.clone(),
            bytes,
        })
    }

    /// Decrypt a sealed payload with the key it names.
    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, BrokerError> {
        let cipher = self.cipher(&sealed.key_id)?;
        if sealed.bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(BrokerError::EncryptionFailure(String::from(
                "ciphertext is too short",
            )));
        }

        let (nonce, ciphertext) = sealed.bytes.split_at(NONCE_LEN);
        let payload = Payload {
            msg: ciphertext,
            aad: sealed.key_id.as_str().as_bytes(),
        };
        cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| BrokerError::EncryptionFailure(String::from("decrypt payload")))
    }

    /// Serialize `value` as JSON and seal it.
    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<Sealed, BrokerError> {
        let plaintext = serde_json::to_vec(value)
            .map_err(|error| BrokerError::EncryptionFailure(format!("serialize payload: {error}")))?;
        self.seal(&plaintext)
    }

    /// Open a sealed payload and parse it as JSON.
    pub fn open_json<T: DeserializeOwned>(&self, sealed: &Sealed) -> Result<T, BrokerError> {
        let plaintext = self.open(sealed)?;
        serde_json::from_slice(&plaintext)
            .map_err(|error| BrokerError::EncryptionFailure(format!("parse payload: {error}")))
    }

    fn cipher(&self, key_id: &KeyId) -> Result<&Aes256Gcm, BrokerError> {
        self.keys.get(key_id).ok_or_else(|| {
            BrokerError::EncryptionFailure(format!("unknown encryption key id {key_id}"))
        })
    }
}

fn derive_cipher(secret: &[u8]) -> Result<Aes256Gcm, BrokerError> {
    if secret.is_empty() {
        return Err(BrokerError::EncryptionFailure(String::from(
            "encryption secret is empty",
        )));
    }
    let key = Sha256::digest(secret);
    Aes256Gcm::new_from_slice(&key)
        .map_err(|error| BrokerError::EncryptionFailure(format!("derive key: {error}")))
}

/// SHA-256 digest of a device code or bearer token.
///
/// Only digests are stored, so a database dump does not leak usable tokens.
/// Not serializable: clients always send the plaintext form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenHash(Vec<u8>);

impl TokenHash {
    /// Wrap a hash loaded from storage.
    pub fn from_stored(hash: impl Into<Vec<u8>>) -> Self {
        Self(hash.into())
    }

    /// Create a new instance from the given plaintext token.
    pub fn new(token: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_ref());
        let hash = hasher.finalize();
        Self(hash.to_vec())
    }

    /// Check `token` against this digest in constant time.
    pub fn verify(&self, token: impl AsRef<[u8]>) -> bool {
        let candidate = Sha256::digest(token.as_ref());
        if self.0.len() != candidate.len() {
            return false;
        }
        let stored = Output::<Sha256>::clone_from_slice(&self.0);
        CtOutput::<Sha256>::new(candidate) == CtOutput::new(stored)
    }

    /// Get the hash as bytes for storage.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&RawToken> for TokenHash {
    fn from(token: &RawToken) -> Self {
        Self::new(token.expose())
    }
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a device code with 256 bits of entropy.
///
/// Returns a 64-character hex string. Only the device ever sees it.
pub fn generate_device_code() -> RawToken {
    RawToken::new(random_hex::<32>())
}

/// Generate an access token with 256 bits of entropy.
pub fn generate_access_token() -> RawToken {
    RawToken::new(random_hex::<32>())
}

/// Generate a refresh token with 256 bits of entropy.
pub fn generate_refresh_token() -> RawToken {
    RawToken::new(random_hex::<32>())
}

/// Consonants only, so codes never spell words and never contain look-alike
/// characters such as `0`/`O` or `1`/`I`.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

/// Length of a user code, excluding the separator.
pub const USER_CODE_LEN: usize = 8;

/// Generate a user code for the device flow in canonical (undashed) form.
///
/// Use [`format_user_code`] to show it to a human.
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    (0..USER_CODE_LEN)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % USER_CODE_ALPHABET.len();
            USER_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Render a canonical user code as `XXXX-XXXX`.
pub fn format_user_code(code: &str) -> String {
    let (head, tail) = code.split_at(code.len() / 2);
    format!("{head}-{tail}")
}

/// Normalize user input into a canonical user code.
///
/// Case, spaces, and dashes are ignored.
pub fn normalize_user_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Claims embedded in a signed authorization state.
#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    #[serde(rename = "o")]
    organization_id: OrgId,
    #[serde(rename = "u")]
    user_id: UserId,
    #[serde(rename = "c")]
    connector: ConnectorType,
    #[serde(rename = "n")]
    nonce: String,
    #[serde(rename = "e")]
    expires_at: i64,
}

/// Signs and verifies the opaque `state` parameter of authorization flows.
///
/// The state carries the initiating organization and user so the callback
/// needs no server-side session. Format: `base64url(claims).base64url(mac)`
/// where the MAC is HMAC-SHA256 over the encoded claims.
#[derive(Clone, Debug)]
#[debug("StateSigner(..)")]
pub struct StateSigner {
    key: Arc<[u8]>,
}

impl StateSigner {
    /// Derive a signing key from an operator secret.
    ///
    /// The derivation is domain separated from the encryption key so the same
    /// secret can feed both.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"switchboard.state.v1:");
        hasher.update(secret.as_ref());
        Self {
            key: Arc::from(hasher.finalize().as_slice()),
        }
    }

    /// Sign a state for `caller` that expires after `ttl`.
    pub fn sign(&self, connector: ConnectorType, caller: &Caller, ttl: Duration) -> String {
        self.sign_at(connector, caller, OffsetDateTime::now_utc() + ttl)
    }

    /// Sign a state that expires at `expires_at`.
    pub fn sign_at(
        &self,
        connector: ConnectorType,
        caller: &Caller,
        expires_at: OffsetDateTime,
    ) -> String {
        let claims = StateClaims {
            organization_id: caller.organization_id.clone(),
            user_id: caller.user_id.clone(),
            connector,
            nonce: random_hex::<16>(),
            expires_at: expires_at.unix_timestamp(),
        };
        // Serializing a struct of strings and integers cannot fail.
        let claims = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(claims);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(encoded.as_bytes()).finalize().into_bytes());
        format!("{encoded}.{signature}")
    }

    /// Verify a state produced by [`StateSigner::sign`] for `connector`.
    pub fn verify(&self, connector: ConnectorType, state: &str) -> Result<Caller, BrokerError> {
        self.verify_at(connector, state, OffsetDateTime::now_utc())
    }

    /// Verify a state as of `now`.
    pub fn verify_at(
        &self,
        connector: ConnectorType,
        state: &str,
        now: OffsetDateTime,
    ) -> Result<Caller, BrokerError> {
        let (encoded, signature) = state.split_once('.').ok_or(BrokerError::InvalidState)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BrokerError::InvalidState)?;
        self.mac(encoded.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| BrokerError::InvalidState)?;

        let claims = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| BrokerError::InvalidState)?;
        let claims = serde_json::from_slice::<StateClaims>(&claims)
            .map_err(|_| BrokerError::InvalidState)?;
        if claims.connector != connector || now.unix_timestamp() >= claims.expires_at {
            return Err(BrokerError::InvalidState);
        }

        Ok(Caller {
            organization_id: claims.organization_id,
            user_id: claims.user_id,
        })
    }

    fn mac(&self, message: &[u8]) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(message);
        mac
    }
}

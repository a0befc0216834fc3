//! The authenticated, timestamped wire envelope: AES-128-CBC encryption
//! under a key derived from the shared secret, HMAC-SHA256 authentication
//! over a version byte + timestamp + IV + ciphertext, all wrapped in
//! URL-safe base64 — the well-known "Fernet" token profile. The embedded
//! timestamp is what lets the collector enforce `token_ttl` as replay
//! protection.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use snafu::Snafu;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0x80;
const IV_LEN: usize = 16;
const HMAC_LEN: usize = 32;
const SIGNING_KEY_LEN: usize = 16;
const ENCRYPTION_KEY_LEN: usize = 16;

#[derive(Debug, Snafu)]
pub enum TokenError {
    #[snafu(display("shared key must decode to {} bytes, got {len}", SIGNING_KEY_LEN + ENCRYPTION_KEY_LEN))]
    BadKeyLength { len: usize },
    #[snafu(display("shared key is not valid base64: {source}"))]
    BadKeyEncoding { source: base64::DecodeError },
    #[snafu(display("token is not valid base64: {source}"))]
    BadTokenEncoding { source: base64::DecodeError },
    #[snafu(display("token is shorter than the minimum envelope size"))]
    Truncated,
    #[snafu(display("token version byte is unsupported"))]
    BadVersion,
    #[snafu(display("token HMAC does not authenticate"))]
    BadMac,
    #[snafu(display("token timestamp is outside the allowed ttl"))]
    Expired,
    #[snafu(display("token ciphertext padding is invalid"))]
    BadPadding,
}

/// A shared key, split into its two halves the way Fernet derives them from
/// a 256-bit secret: the first 16 bytes sign, the last 16 bytes encrypt.
#[derive(Clone)]
pub struct SharedKey {
    signing_key: [u8; SIGNING_KEY_LEN],
    encryption_key: [u8; ENCRYPTION_KEY_LEN],
}

impl SharedKey {
    /// Parses a base64 shared key as produced by `keygen` / `Agent.key`.
    pub fn from_base64(encoded: &str) -> Result<Self, TokenError> {
        let raw = URL_SAFE
            .decode(encoded.trim())
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(encoded.trim()))
            .map_err(|source| TokenError::BadKeyEncoding { source })?;
        if raw.len() != SIGNING_KEY_LEN + ENCRYPTION_KEY_LEN {
            return Err(TokenError::BadKeyLength { len: raw.len() });
        }
        let mut signing_key = [0u8; SIGNING_KEY_LEN];
        let mut encryption_key = [0u8; ENCRYPTION_KEY_LEN];
        signing_key.copy_from_slice(&raw[..SIGNING_KEY_LEN]);
        encryption_key.copy_from_slice(&raw[SIGNING_KEY_LEN..]);
        Ok(SharedKey {
            signing_key,
            encryption_key,
        })
    }

    /// Generates a fresh random key, base64-encoded, for the `keygen`
    /// subcommand.
    pub fn generate() -> String {
        use rand::RngCore;
        let mut raw = [0u8; SIGNING_KEY_LEN + ENCRYPTION_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        URL_SAFE.encode(raw)
    }
}

/// Encrypts `plaintext` under `key`, embedding `now` (seconds since epoch)
/// as the token's freshness timestamp.
pub fn encrypt(key: &SharedKey, plaintext: &[u8], now: u64) -> String {
    let mut iv = [0u8; IV_LEN];
    {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut iv);
    }
    let ciphertext = Aes128CbcEnc::new(&key.encryption_key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut body = Vec::with_capacity(1 + 8 + IV_LEN + ciphertext.len());
    body.push(VERSION);
    body.extend_from_slice(&now.to_be_bytes());
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);

    let mut mac = HmacSha256::new_from_slice(&key.signing_key).expect("hmac accepts any key length");
    mac.update(&body);
    let tag = mac.finalize().into_bytes();

    body.extend_from_slice(&tag);
    URL_SAFE.encode(body)
}

/// Authenticated-decrypts `token`, rejecting it if its HMAC doesn't verify
/// or if its embedded timestamp is older than `ttl_secs` relative to `now`
/// — the replay-protection check.
pub fn decrypt(key: &SharedKey, token: &str, now: u64, ttl_secs: u64) -> Result<Vec<u8>, TokenError> {
    let body = URL_SAFE
        .decode(token.trim())
        .map_err(|source| TokenError::BadTokenEncoding { source })?;
    if body.len() < 1 + 8 + IV_LEN + HMAC_LEN {
        return Err(TokenError::Truncated);
    }
    let (signed, tag) = body.split_at(body.len() - HMAC_LEN);
    if signed[0] != VERSION {
        return Err(TokenError::BadVersion);
    }

    let mut mac = HmacSha256::new_from_slice(&key.signing_key).expect("hmac accepts any key length");
    mac.update(signed);
    mac.verify_slice(tag).map_err(|_| TokenError::BadMac)?;

    let timestamp = u64::from_be_bytes(signed[1..9].try_into().expect("checked length above"));
    let age = now.saturating_sub(timestamp);
    if age > ttl_secs {
        return Err(TokenError::Expired);
    }

    let iv: [u8; IV_LEN] = signed[9..9 + IV_LEN].try_into().expect("checked length above");
    let ciphertext = &signed[9 + IV_LEN..];
    Aes128CbcDec::new(&key.encryption_key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| TokenError::BadPadding)
}

//! AES-256-GCM sealing for credentials that leave process memory.

use anyhow::{anyhow, Context, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

pub type SealingKey = [u8; KEY_BYTES];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub version: u8,
    pub nonce_hex: String,
    pub ciphertext_hex: String,
}

pub fn seal_json<T: Serialize>(value: &T, key: &SealingKey) -> Result<SealedEnvelope> {
    let mut plaintext = serde_json::to_vec(value).context("serialize payload for sealing")?;
    let key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| anyhow!("generate random nonce"))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut plaintext,
    )
    .map_err(|_| anyhow!("seal payload"))?;

    Ok(SealedEnvelope {
        version: ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&plaintext),
    })
}

pub fn open_json<T: DeserializeOwned>(envelope: &SealedEnvelope, key: &SealingKey) -> Result<T> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(anyhow!(
            "unsupported envelope version {}",
            envelope.version
        ));
    }

    let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)
        .context("decode envelope nonce")?
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in envelope"))?;
    let mut ciphertext = hex_decode(&envelope.ciphertext_hex).context("decode envelope ciphertext")?;

    let plaintext = aead_key(key)?
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| anyhow!("open sealed payload (wrong key or tampered data)"))?;

    serde_json::from_slice(plaintext).context("parse opened payload")
}

pub fn parse_key_hex(raw: &str) -> Result<SealingKey> {
    let decoded = hex_decode(raw).context("decode sealing key hex")?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("sealing key must be {KEY_BYTES} bytes"))
}

fn aead_key(key: &SealingKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(anyhow!("hex string length must be even"));
    }

    bytes
        .chunks(2)
        .map(|pair| {
            let hi = hex_nibble(pair[0]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            let lo = hex_nibble(pair[1]).ok_or_else(|| anyhow!("invalid hex digit"))?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

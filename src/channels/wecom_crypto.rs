//! WeCom callback message crypto: SHA-1 msg_signature plus AES-256-CBC
//! payload encryption as specified by the WeCom callback protocol.
//!
//! The `encoding_aes_key` is 43 base64 chars (padded to 44) decoding to a
//! 32-byte key; the IV is the first 16 bytes of the key. Plaintext layout is
//! `[16 random bytes][4-byte big-endian msg length][msg][receiver_id]` with
//! PKCS#7 padding to the 32-byte block used by WeCom.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 32;

/// Decode the 43-char `encoding_aes_key` into the 32-byte AES key.
pub fn decode_aes_key(encoding_aes_key: &str) -> Result<[u8; 32]> {
    let decoded = BASE64
        .decode(format!("{encoding_aes_key}="))
        .context("encoding_aes_key is not valid base64")?;
    let key: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("encoding_aes_key must decode to 32 bytes"))?;
    Ok(key)
}

/// Compute the callback signature: sha1 of the lexicographically sorted
/// `[token, timestamp, nonce, encrypted]` concatenation.
pub fn msg_signature(token: &str, timestamp: &str, nonce: &str, encrypted: &str) -> String {
    let mut parts = [token, timestamp, nonce, encrypted];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex_encode(&hasher.finalize())
}

/// Constant-shape signature check for a callback request.
pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypted: &str,
    signature: &str,
) -> bool {
    msg_signature(token, timestamp, nonce, encrypted) == signature
}

/// Decrypt a callback payload, returning the inner message bytes.
pub fn decrypt(encoding_aes_key: &str, encrypted_b64: &str) -> Result<Vec<u8>> {
    let key = decode_aes_key(encoding_aes_key)?;
    let ciphertext = BASE64
        .decode(encrypted_b64.trim())
        .context("encrypted payload is not valid base64")?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        bail!("encrypted payload has invalid length {}", ciphertext.len());
    }

    let mut buf = ciphertext;
    let decryptor = Aes256CbcDec::new_from_slices(&key, &key[..16])
        .map_err(|e| anyhow::anyhow!("AES init failed: {e}"))?;
    let plain = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| anyhow::anyhow!("AES decrypt failed: {e}"))?;

    // Strip PKCS#7 padding.
    let pad = *plain
        .last()
        .ok_or_else(|| anyhow::anyhow!("empty plaintext"))? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > plain.len() {
        bail!("invalid padding byte {pad}");
    }
    let plain = &plain[..plain.len() - pad];

    // [16 random][4-byte len][msg][receiver_id]
    if plain.len() < 20 {
        bail!("plaintext too short");
    }
    let msg_len = u32::from_be_bytes([plain[16], plain[17], plain[18], plain[19]]) as usize;
    if plain.len() < 20 + msg_len {
        bail!("declared message length exceeds plaintext");
    }
    Ok(plain[20..20 + msg_len].to_vec())
}

/// Encrypt a reply payload for a passive callback response.
pub fn encrypt(encoding_aes_key: &str, msg: &[u8], receiver_id: &str) -> Result<String> {
    let key = decode_aes_key(encoding_aes_key)?;

    let mut plain = Vec::with_capacity(20 + msg.len() + receiver_id.len() + BLOCK_SIZE);
    let mut random = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut random);
    plain.extend_from_slice(&random);
    plain.extend_from_slice(&(msg.len() as u32).to_be_bytes());
    plain.extend_from_slice(msg);
    plain.extend_from_slice(receiver_id.as_bytes());

    let pad = BLOCK_SIZE - (plain.len() % BLOCK_SIZE);
    plain.extend(std::iter::repeat(pad as u8).take(pad));

    let len = plain.len();
    let encryptor = Aes256CbcEnc::new_from_slices(&key, &key[..16])
        .map_err(|e| anyhow::anyhow!("AES init failed: {e}"))?;
    let encrypted = encryptor
        .encrypt_padded_mut::<NoPadding>(&mut plain, len)
        .map_err(|e| anyhow::anyhow!("AES encrypt failed: {e}"))?;
    Ok(BASE64.encode(encrypted))
}

/// Pull a field out of the small callback XML documents without a full XML
/// parser; handles both plain text and CDATA values.
pub fn extract_xml_field(xml: &str, field: &str) -> Option<String> {
    let open = format!("<{field}>");
    let close = format!("</{field}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    let value = &xml[start..end];
    let value = value
        .strip_prefix("<![CDATA[")
        .and_then(|v| v.strip_suffix("]]>"))
        .unwrap_or(value);
    Some(value.to_string())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // 43 base64 chars decoding (with padding) to 32 bytes.
    const TEST_KEY: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQ";

    #[test]
    fn aes_key_decodes_to_32_bytes() {
        let key = decode_aes_key(TEST_KEY).unwrap();
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn bad_aes_key_is_rejected() {
        assert!(decode_aes_key("short").is_err());
        assert!(decode_aes_key("!!!not-base64-at-all!!!").is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let msg = b"<xml><Content>hello</Content></xml>";
        let encrypted = encrypt(TEST_KEY, msg, "corp123").unwrap();
        let decrypted = decrypt(TEST_KEY, &encrypted).unwrap();
        assert_eq!(decrypted, msg);
    }

    #[test]
    fn signature_is_order_independent_of_inputs() {
        let sig = msg_signature("tok", "123", "nonce", "payload");
        assert_eq!(sig.len(), 40);
        assert!(verify_signature("tok", "123", "nonce", "payload", &sig));
        assert!(!verify_signature("tok", "123", "nonce", "payload", "wrong"));
        assert!(!verify_signature("other", "123", "nonce", "payload", &sig));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let encrypted = encrypt(TEST_KEY, b"msg", "corp").unwrap();
        assert!(decrypt(TEST_KEY, "AAAA").is_err());
        // Flipping padding-length declarations must not panic.
        let mut bytes = BASE64.decode(&encrypted).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xff;
        }
        let _ = decrypt(TEST_KEY, &BASE64.encode(bytes));
    }

    #[test]
    fn xml_field_extraction_handles_cdata() {
        let xml = "<xml><Content><![CDATA[hi there]]></Content><MsgId>99</MsgId></xml>";
        assert_eq!(extract_xml_field(xml, "Content").as_deref(), Some("hi there"));
        assert_eq!(extract_xml_field(xml, "MsgId").as_deref(), Some("99"));
        assert!(extract_xml_field(xml, "Missing").is_none());
    }
}

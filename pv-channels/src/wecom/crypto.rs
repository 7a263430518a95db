//! WeCom callback message signing and AES-256-CBC envelope encryption.
//!
//! Plaintext layout: `random(16) | msg_len(u32 BE) | msg | corp_id`, PKCS#7 padded to 32 bytes.

use aes::Aes256;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{Result, anyhow};
use base64::Engine;
use sha1::{Digest, Sha1};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const PAD_BLOCK: usize = 32;
const HEADER_LEN: usize = 20;

#[derive(Clone)]
pub struct WecomCrypto {
    token: String,
    key: Vec<u8>,
    corp_id: String,
}

impl std::fmt::Debug for WecomCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomCrypto")
            .field("corp_id", &self.corp_id)
            .finish_non_exhaustive()
    }
}

impl WecomCrypto {
    pub fn new(token: &str, encoding_aes_key: &str, corp_id: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(anyhow!("wecom token missing"));
        }
        let corp_id = corp_id.trim();
        if corp_id.is_empty() {
            return Err(anyhow!("wecom corp_id missing"));
        }
        Ok(Self {
            token: token.to_string(),
            key: decode_encoding_aes_key(encoding_aes_key)?,
            corp_id: corp_id.to_string(),
        })
    }

    /// hex(sha1(sorted(token, timestamp, nonce, encrypted))).
    pub fn signature(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, encrypted];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> bool {
        let signature = signature.trim();
        let timestamp = timestamp.trim();
        let nonce = nonce.trim();
        let encrypted = encrypted.trim();
        if signature.is_empty() || timestamp.is_empty() || nonce.is_empty() || encrypted.is_empty()
        {
            return false;
        }
        self.signature(timestamp, nonce, encrypted)
            .eq_ignore_ascii_case(signature)
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let encrypted = encrypted.trim();
        if encrypted.is_empty() {
            return Err(anyhow!("wecom encrypted payload is empty"));
        }
        let mut buffer = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|_| anyhow!("wecom encrypted payload is not valid base64"))?;
        if buffer.is_empty() || buffer.len() % 16 != 0 {
            return Err(anyhow!("wecom encrypted payload has invalid length"));
        }

        let iv = &self.key[..16];
        let plain = Aes256CbcDec::new(self.key.as_slice().into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| anyhow!("wecom payload decrypt failed"))?;
        let plain = strip_padding(plain)?;
        if plain.len() < HEADER_LEN {
            return Err(anyhow!("wecom payload is too short"));
        }

        let msg_len: [u8; 4] = plain[16..HEADER_LEN]
            .try_into()
            .map_err(|_| anyhow!("wecom payload length parse failed"))?;
        let msg_end = HEADER_LEN + u32::from_be_bytes(msg_len) as usize;
        if msg_end > plain.len() {
            return Err(anyhow!("wecom payload length out of range"));
        }

        let receive_id = String::from_utf8_lossy(&plain[msg_end..]);
        if receive_id != self.corp_id {
            return Err(anyhow!(
                "wecom payload corp_id mismatch: {receive_id} != {}",
                self.corp_id
            ));
        }

        String::from_utf8(plain[HEADER_LEN..msg_end].to_vec())
            .map_err(|_| anyhow!("wecom payload body is not utf-8"))
    }

    pub fn encrypt(&self, message: &str) -> Result<String> {
        self.encrypt_with_nonce(message, uuid::Uuid::new_v4().into_bytes())
    }

    fn encrypt_with_nonce(&self, message: &str, random: [u8; 16]) -> Result<String> {
        let body = message.as_bytes();
        let body_len =
            u32::try_from(body.len()).map_err(|_| anyhow!("wecom message is too large"))?;

        let mut data = Vec::with_capacity(HEADER_LEN + body.len() + self.corp_id.len() + PAD_BLOCK);
        data.extend_from_slice(&random);
        data.extend_from_slice(&body_len.to_be_bytes());
        data.extend_from_slice(body);
        data.extend_from_slice(self.corp_id.as_bytes());
        let pad = PAD_BLOCK - (data.len() % PAD_BLOCK);
        data.extend(std::iter::repeat_n(pad as u8, pad));

        let len = data.len();
        let iv = &self.key[..16];
        let cipher = Aes256CbcEnc::new(self.key.as_slice().into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut data, len)
            .map_err(|_| anyhow!("wecom payload encrypt failed"))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(cipher))
    }
}

fn strip_padding(plain: &[u8]) -> Result<&[u8]> {
    let pad = plain
        .last()
        .copied()
        .map(usize::from)
        .ok_or_else(|| anyhow!("wecom payload is empty"))?;
    if pad == 0 || pad > PAD_BLOCK || pad > plain.len() {
        return Err(anyhow!("wecom payload padding invalid"));
    }
    Ok(&plain[..plain.len() - pad])
}

/// EncodingAESKey is 43 base64 chars; appending `=` yields the 32-byte AES key.
fn decode_encoding_aes_key(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("wecom encoding_aes_key missing"));
    }
    let padded = if raw.ends_with('=') {
        raw.to_string()
    } else {
        format!("{raw}=")
    };
    // Keys in the wild do not always have zeroed trailing bits.
    let lenient = base64::engine::GeneralPurpose::new(
        &base64::alphabet::STANDARD,
        base64::engine::GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
    );
    let key = lenient
        .decode(padded)
        .map_err(|_| anyhow!("wecom encoding_aes_key is invalid base64"))?;
    if key.len() != 32 {
        return Err(anyhow!("wecom encoding_aes_key length invalid"));
    }
    Ok(key)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 43-char key whose decoded form is 32 bytes.
    pub(crate) const TEST_AES_KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    pub(crate) fn test_crypto() -> WecomCrypto {
        WecomCrypto::new("token", TEST_AES_KEY, "corp123").expect("valid crypto config")
    }

    #[test]
    fn signature_sorts_parts_before_hashing() {
        let crypto = test_crypto();
        let mut parts = ["token", "1710000000", "abc", "cipher_text"];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        let expected = hex::encode(hasher.finalize());

        assert_eq!(crypto.signature("1710000000", "abc", "cipher_text"), expected);
        assert!(crypto.verify_signature(&expected.to_uppercase(), "1710000000", "abc", "cipher_text"));
        assert!(!crypto.verify_signature(&expected, "1710000001", "abc", "cipher_text"));
        assert!(!crypto.verify_signature("", "1710000000", "abc", "cipher_text"));
    }

    #[test]
    fn encrypt_then_decrypt_recovers_message() {
        let crypto = test_crypto();
        for message in ["", "hi", "<xml><Content>你好</Content></xml>"] {
            let sealed = crypto
                .encrypt_with_nonce(message, [7u8; 16])
                .expect("encrypt");
            assert_eq!(crypto.decrypt(&sealed).expect("decrypt"), message);
        }
    }

    #[test]
    fn decrypt_rejects_foreign_corp_id() {
        let other = WecomCrypto::new("token", TEST_AES_KEY, "other-corp").expect("valid");
        let sealed = other.encrypt("hello").expect("encrypt");
        let err = test_crypto().decrypt(&sealed).expect_err("corp mismatch");
        assert!(err.to_string().contains("corp_id mismatch"));
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let crypto = test_crypto();
        assert!(crypto.decrypt("not base64!!").is_err());
        assert!(crypto.decrypt("AAAA").is_err());
    }

    #[test]
    fn rejects_short_aes_key() {
        assert!(WecomCrypto::new("token", "c2hvcnQ", "corp").is_err());
    }
}

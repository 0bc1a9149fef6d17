//! AES encryption and decryption using CTR (note ciphertexts) and GCM
//! (at-rest wallet blobs) modes.

use aes::{
    Aes256,
    cipher::{KeyIvInit, StreamCipher},
};
use aes_gcm::{
    AesGcm, KeyInit, Nonce,
    aead::{Aead, Payload, consts::U16},
};
use rand::random;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiphertextCtr {
    pub iv: [u8; 16],
    pub data: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub iv: [u8; 16],
    pub tag: [u8; 16],
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum AesError {
    #[error("encrypt error: {0}")]
    Gcm(aes_gcm::Error),
    #[error("decrypt error: {0}")]
    Decrypt(aes_gcm::Error),
    #[error("Encrypted data is too short")]
    DataTooShort,
}

type Aes256GcmU16 = AesGcm<Aes256, U16>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Truncates or right-pads key material to the AES-256 key width.
fn normalize_key(key: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = key.len().min(32);
    out[..len].copy_from_slice(&key[..len]);
    out
}

pub fn encrypt_ctr(plaintext: &[&[u8]], key: &[u8]) -> CiphertextCtr {
    let iv: [u8; 16] = random();
    encrypt_ctr_with_iv(plaintext, key, &iv)
}

pub fn encrypt_ctr_with_iv(plaintext: &[&[u8]], key: &[u8], iv: &[u8; 16]) -> CiphertextCtr {
    let key = normalize_key(key);
    let mut cipher = Aes256Ctr::new(&key.into(), iv.into());
    let mut data = Vec::with_capacity(plaintext.len());

    for block in plaintext {
        let mut buffer = block.to_vec();
        cipher.apply_keystream(&mut buffer);
        data.push(buffer);
    }

    CiphertextCtr { iv: *iv, data }
}

pub fn decrypt_ctr(ciphertext: &CiphertextCtr, key: &[u8]) -> Vec<Vec<u8>> {
    let key = normalize_key(key);
    let mut cipher = Aes256Ctr::new(&key.into(), &ciphertext.iv.into());
    let mut data = Vec::with_capacity(ciphertext.data.len());

    for block in &ciphertext.data {
        let mut buffer = block.to_vec();
        cipher.apply_keystream(&mut buffer);
        data.push(buffer);
    }

    data
}

pub fn encrypt_gcm(plaintext: &[u8], key: &[u8; 32]) -> Result<Ciphertext, AesError> {
    let iv: [u8; 16] = random();

    //? Safe to unwrap as key length is fixed
    let cipher = Aes256GcmU16::new_from_slice(key).unwrap();
    let nonce = Nonce::<U16>::from_slice(&iv);

    let mut encrypted = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .map_err(AesError::Gcm)?;

    if encrypted.len() < 16 {
        return Err(AesError::DataTooShort);
    }
    let tag_bytes = encrypted.split_off(encrypted.len() - 16);
    let tag: [u8; 16] = tag_bytes.try_into().unwrap();

    Ok(Ciphertext {
        iv,
        tag,
        data: encrypted,
    })
}

pub fn decrypt_gcm(ciphertext: &Ciphertext, key: &[u8; 32]) -> Result<Vec<u8>, AesError> {
    //? Safe to unwrap as key length is fixed
    let cipher = Aes256GcmU16::new_from_slice(key).unwrap();
    let nonce = Nonce::<U16>::from_slice(&ciphertext.iv);

    let mut combined = ciphertext.data.clone();
    combined.extend_from_slice(&ciphertext.tag);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined,
                aad: &[],
            },
        )
        .map_err(AesError::Decrypt)
}

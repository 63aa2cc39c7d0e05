//! Session handshake and payload encryption
//!
//! The controller authenticates with a nonce challenge: both sides hash
//! `lowercase(user)\0password\0` with SHA-256, XOR three of the digest
//! words with the exchanged nonces, and fold the eight words into a
//! 128-bit AES key. An AES-ECB encryption of the upper digest words
//! yields the challenge response (client proves the password) and the
//! confirmation (controller proves it too).
//!
//! After authentication every frame is encrypted with AES in a chained
//! accumulator mode: each 16-byte block is XORed with the running
//! accumulator before encryption, and the accumulator is replaced by
//! `ciphertext XOR plaintext`. A fresh random IV rides in the final
//! block of every message, with the payload length's low nibble folded
//! into its last byte.

use crate::error::{HomesideError, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

const BLOCK: usize = 16;

/// Key material and proof values derived from one challenge exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSecrets {
    /// Symmetric key for the message cipher
    pub key: [u8; 16],
    /// Challenge response the client sends
    pub response: u32,
    /// Confirmation the controller must echo back
    pub confirmation: u32,
}

/// Random 32-bit nonce in the protocol's byte order
pub fn random_nonce() -> u32 {
    swap_end(rand::random::<u32>())
}

/// Random message IV
pub fn random_iv() -> [u8; 16] {
    rand::random::<[u8; 16]>()
}

fn swap_end(value: u32) -> u32 {
    value.swap_bytes()
}

/// Derive the session key, challenge response and confirmation
///
/// Pure; the controller side performs the same derivation to verify the
/// response. The web UI lowercases the username before hashing, so we do.
pub fn derive_session_secrets(
    username: &str,
    password: &str,
    client_nonce1: u32,
    server_nonce: u32,
    client_nonce2: u32,
) -> SessionSecrets {
    use sha2::{Digest, Sha256};

    let payload = format!("{}\0{}\0", username.to_lowercase(), password);
    let digest = Sha256::digest(payload.as_bytes());

    let mut words = [0u32; 8];
    for (i, word) in words.iter_mut().enumerate() {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest[i * 4..i * 4 + 4]);
        *word = u32::from_be_bytes(bytes);
    }

    words[5] ^= swap_end(client_nonce1);
    words[6] ^= swap_end(server_nonce);
    words[7] ^= swap_end(client_nonce2);

    let mut key = [0u8; 16];
    for i in 0..4 {
        key[i * 4..i * 4 + 4].copy_from_slice(&(words[i] ^ words[i + 4]).to_be_bytes());
    }

    let mut block = [0u8; 16];
    for i in 0..4 {
        block[i * 4..i * 4 + 4].copy_from_slice(&words[i + 4].to_be_bytes());
    }

    let cipher = Aes128::new(GenericArray::from_slice(&key));
    let mut encrypted = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut encrypted);

    let mut word0 = [0u8; 4];
    word0.copy_from_slice(&encrypted[0..4]);
    let mut word1 = [0u8; 4];
    word1.copy_from_slice(&encrypted[4..8]);

    SessionSecrets {
        key,
        response: swap_end(u32::from_be_bytes(word0)),
        confirmation: swap_end(u32::from_be_bytes(word1)),
    }
}

/// Stateful message cipher with separate send and receive accumulators
pub struct MessageCipher {
    cipher: Aes128,
    send_acc: [u8; BLOCK],
    recv_acc: [u8; BLOCK],
}

impl std::fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs
        f.debug_struct("MessageCipher").finish_non_exhaustive()
    }
}

impl MessageCipher {
    /// `send_iv` is the accumulator seed we announced, `recv_iv` the peer's
    pub fn new(key: &[u8; 16], send_iv: [u8; BLOCK], recv_iv: [u8; BLOCK]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            send_acc: send_iv,
            recv_acc: recv_iv,
        }
    }

    /// Encrypt one outgoing message
    pub fn encrypt(&mut self, text: &str) -> Vec<u8> {
        let bytes = text.as_bytes();
        let padded = BLOCK * ((bytes.len() + BLOCK) / BLOCK);
        let mut out = vec![0u8; padded];

        // IV fills the last block; the payload may overwrite its head
        out[padded - BLOCK..].copy_from_slice(&random_iv());
        out[..bytes.len()].copy_from_slice(bytes);
        out[padded - 1] = (out[padded - 1] & 0xF0) | (bytes.len() % BLOCK) as u8;

        for start in (0..padded).step_by(BLOCK) {
            let mut block = [0u8; BLOCK];
            for i in 0..BLOCK {
                block[i] = self.send_acc[i] ^ out[start + i];
            }
            let mut encrypted = GenericArray::clone_from_slice(&block);
            self.cipher.encrypt_block(&mut encrypted);
            for i in 0..BLOCK {
                self.send_acc[i] = encrypted[i] ^ out[start + i];
                out[start + i] = encrypted[i];
            }
        }
        out
    }

    /// Decrypt one incoming message
    pub fn decrypt(&mut self, data: &[u8]) -> Result<String> {
        if data.is_empty() || data.len() % BLOCK != 0 {
            return Err(HomesideError::crypto(format!(
                "invalid encrypted message length {}",
                data.len()
            )));
        }

        let mut out = vec![0u8; data.len()];
        for start in (0..data.len()).step_by(BLOCK) {
            let mut decrypted = GenericArray::clone_from_slice(&data[start..start + BLOCK]);
            self.cipher.decrypt_block(&mut decrypted);
            for i in 0..BLOCK {
                out[start + i] = decrypted[i] ^ self.recv_acc[i];
            }
            for i in 0..BLOCK {
                self.recv_acc[i] = data[start + i] ^ out[start + i];
            }
        }

        let nibble = (out[out.len() - 1] & 0x0F) as usize;
        let length = if nibble == 0 {
            out.len() - BLOCK
        } else {
            out.len() - BLOCK + nibble
        };
        out.truncate(length);

        String::from_utf8(out)
            .map_err(|e| HomesideError::crypto(format!("decrypted payload is not UTF-8: {e}")))
    }
}

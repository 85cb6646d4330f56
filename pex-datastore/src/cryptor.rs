//! Bundle cryptor family.
//!
//! AES-256-GCM is an authenticated mode, so no separate MAC section is
//! written; the 16-byte GCM tag becomes the MAC segment of the file
//! contents. The "none" cryptor passes data through and produces neither
//! headers nor MAC.

use anyhow::{bail, Error};
use openssl::symm::{Cipher, Crypter, Mode};

use pex_key_config::KeyingData;

use crate::file_formats::EncryptedFileHeaders;

/// Length of the random initialization vector written into the file
/// headers.
pub const IV_LENGTH: usize = 32;
pub const GCM_TAG_LENGTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionType {
    None,
    Aes256Gcm,
}

pub enum Cryptor {
    None,
    Aes256Gcm {
        crypter: Crypter,
        header_block: Vec<u8>,
        block_size: usize,
    },
}

impl Cryptor {
    /// Set up encryption for one bundle. For AES-256-GCM this draws a
    /// fresh random IV and records the key derivation parameters in the
    /// header block.
    pub fn new(encryption_type: EncryptionType, keying: &KeyingData) -> Result<Self, Error> {
        match encryption_type {
            EncryptionType::None => Ok(Cryptor::None),
            EncryptionType::Aes256Gcm => {
                let mut iv = [0u8; IV_LENGTH];
                openssl::rand::rand_bytes(&mut iv)?;

                let mut headers = EncryptedFileHeaders::new();
                headers.set_key_derivation(&keying.derivation)?;
                headers.set_encryption_aes256_gcm(iv);

                let cipher = Cipher::aes_256_gcm();
                let crypter = Crypter::new(
                    cipher,
                    Mode::Encrypt,
                    &keying.encryption_key,
                    Some(&iv),
                )?;

                Ok(Cryptor::Aes256Gcm {
                    crypter,
                    header_block: headers.header_block(),
                    block_size: cipher.block_size(),
                })
            }
        }
    }

    /// Encrypt a slice of container bytes, appending ciphertext to `out`.
    pub fn encrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            Cryptor::None => {
                out.extend_from_slice(data);
                Ok(())
            }
            Cryptor::Aes256Gcm {
                crypter,
                block_size,
                ..
            } => {
                let offset = out.len();
                out.resize(offset + data.len() + *block_size, 0);
                let count = crypter.update(data, &mut out[offset..])?;
                out.truncate(offset + count);
                Ok(())
            }
        }
    }

    /// Finish encryption; returns the header block and the MAC bytes that
    /// frame the ciphertext in the finished file. Both are empty for the
    /// "none" cryptor.
    pub fn finalize(self, out: &mut Vec<u8>) -> Result<(Vec<u8>, Vec<u8>), Error> {
        match self {
            Cryptor::None => Ok((Vec::new(), Vec::new())),
            Cryptor::Aes256Gcm {
                mut crypter,
                header_block,
                block_size,
            } => {
                let offset = out.len();
                out.resize(offset + block_size, 0);
                let count = crypter.finalize(&mut out[offset..])?;
                out.truncate(offset + count);

                let mut tag = [0u8; GCM_TAG_LENGTH];
                crypter.get_tag(&mut tag)?;
                Ok((header_block, tag.to_vec()))
            }
        }
    }
}

/// Decrypt a full bundle ciphertext given the IV and tag. Used to verify
/// finished bundles; the backup path itself never decrypts.
pub fn decrypt_aes256_gcm(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, Error> {
    if iv.len() != IV_LENGTH {
        bail!("unexpected iv length {}", iv.len());
    }
    let out = openssl::symm::decrypt_aead(
        Cipher::aes_256_gcm(),
        key,
        Some(iv),
        &[],
        ciphertext,
        tag,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_formats::{AES_256_GCM_PARAMETERS_LENGTH, GENERIC_HEADER_LENGTH};
    use pex_key_config::KeyDerivation;

    fn test_keying() -> KeyingData {
        KeyingData {
            encryption_key: [1u8; 32],
            mac_key: [2u8; 32],
            derivation: KeyDerivation::None,
        }
    }

    #[test]
    fn none_cryptor_is_passthrough() {
        let mut cryptor = Cryptor::new(EncryptionType::None, &test_keying()).unwrap();
        let mut out = Vec::new();
        cryptor.encrypt(b"plain container", &mut out).unwrap();
        let (headers, mac) = cryptor.finalize(&mut out).unwrap();
        assert_eq!(out, b"plain container");
        assert!(headers.is_empty());
        assert!(mac.is_empty());
    }

    #[test]
    fn gcm_round_trip() {
        let keying = test_keying();
        let mut cryptor = Cryptor::new(EncryptionType::Aes256Gcm, &keying).unwrap();

        let plaintext = vec![0x5au8; 4096];
        let mut ciphertext = Vec::new();
        cryptor.encrypt(&plaintext[..1000], &mut ciphertext).unwrap();
        cryptor.encrypt(&plaintext[1000..], &mut ciphertext).unwrap();
        let (headers, mac) = cryptor.finalize(&mut ciphertext).unwrap();

        assert_eq!(
            headers.len(),
            4 + GENERIC_HEADER_LENGTH + AES_256_GCM_PARAMETERS_LENGTH
        );
        assert_eq!(mac.len(), GCM_TAG_LENGTH);
        assert_ne!(ciphertext, plaintext);

        let iv = &headers[headers.len() - IV_LENGTH..];
        let decrypted =
            decrypt_aes256_gcm(&keying.encryption_key, iv, &ciphertext, &mac).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn gcm_detects_tampering() {
        let keying = test_keying();
        let mut cryptor = Cryptor::new(EncryptionType::Aes256Gcm, &keying).unwrap();
        let mut ciphertext = Vec::new();
        cryptor.encrypt(b"bytes to protect", &mut ciphertext).unwrap();
        let (headers, mac) = cryptor.finalize(&mut ciphertext).unwrap();

        ciphertext[0] ^= 0xff;
        let iv = &headers[headers.len() - IV_LENGTH..];
        assert!(decrypt_aes256_gcm(&keying.encryption_key, iv, &ciphertext, &mac).is_err());
    }
}

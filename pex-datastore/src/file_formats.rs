//! Encrypted bundle file binary format.
//!
//! A finalized bundle file is laid out as:
//!
//! ```text
//! +--------------------------------------------------+
//! | "PEX\0"                         (4 bytes magic)  |
//! | GenericHeader                                    |
//! | KeyDerivationParameters (depending on kd type)   |
//! | EncryptionParameters    (depending on enc type)  |
//! | MACParameters           (depending on mac type)  |
//! | Ciphertext (TAR container, encrypted)            |
//! | MAC                     (optional)               |
//! +--------------------------------------------------+
//! ```
//!
//! Type-id fields are 15 bytes, NUL-terminated and NUL-padded ASCII; the
//! ids match the names the OpenSSL command line tool uses for the same
//! algorithms. Every section carries its own 8-bit format version so the
//! parameter layouts can evolve independently. All fields are single
//! bytes or byte arrays, stored exactly as written here.
//!
//! With encryption type "none" the header block is empty and the file is
//! the bare TAR container.

use anyhow::{bail, Error};

use pex_key_config::KeyDerivation;

/// First four bytes of every encrypted bundle file.
pub const BUNDLE_MAGIC: [u8; 4] = *b"PEX\0";

pub const TYPE_ID_LENGTH: usize = 15;

pub const KEY_DERIVATION_TYPE_ID_NONE: &str = "";
pub const KEY_DERIVATION_TYPE_ID_PBKDF2: &str = "pbkdf2";
pub const KEY_DERIVATION_TYPE_ID_HKDF_SHA256: &str = "hkdf-sha-256";

pub const ENCRYPTION_TYPE_ID_AES_256_GCM: &str = "aes-256-gcm";

pub const MAC_TYPE_ID_NONE: &str = "";

/// Byte length of the generic header (not counting the magic).
pub const GENERIC_HEADER_LENGTH: usize = 1 + 3 * (TYPE_ID_LENGTH + 1);
pub const PBKDF2_PARAMETERS_LENGTH: usize = 1 + 32 + 32;
pub const HKDF_SHA256_PARAMETERS_LENGTH: usize = 1 + 32 + 32 + 32;
pub const AES_256_GCM_PARAMETERS_LENGTH: usize = 32;

fn push_type_id(block: &mut Vec<u8>, type_id: &str) {
    debug_assert!(type_id.len() < TYPE_ID_LENGTH);
    let mut field = [0u8; TYPE_ID_LENGTH];
    field[..type_id.len()].copy_from_slice(type_id.as_bytes());
    block.extend_from_slice(&field);
}

/// Builder for the header block of an encrypted bundle file.
///
/// The cryptor fills one of these in from the keying data and serializes
/// it in front of the ciphertext.
#[derive(Default)]
pub struct EncryptedFileHeaders {
    key_derivation_type_id: String,
    pbkdf2_iteration_count_exponent: u8,
    hkdf_info: Vec<u8>,
    encryption_key_salt: [u8; 32],
    mac_key_salt: [u8; 32],
    encryption_type_id: String,
    initialization_vector: [u8; 32],
}

impl EncryptedFileHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the key derivation section from the keying data's
    /// derivation parameters.
    pub fn set_key_derivation(&mut self, derivation: &KeyDerivation) -> Result<(), Error> {
        match derivation {
            KeyDerivation::None => {
                self.key_derivation_type_id = KEY_DERIVATION_TYPE_ID_NONE.to_string();
            }
            KeyDerivation::Pbkdf2 {
                iteration_count_exponent,
                encryption_key_salt,
                mac_key_salt,
            } => {
                self.key_derivation_type_id = KEY_DERIVATION_TYPE_ID_PBKDF2.to_string();
                self.pbkdf2_iteration_count_exponent = *iteration_count_exponent;
                self.encryption_key_salt = *encryption_key_salt;
                self.mac_key_salt = *mac_key_salt;
            }
            KeyDerivation::HkdfSha256 {
                info,
                encryption_key_salt,
                mac_key_salt,
            } => {
                if info.len() > 32 {
                    bail!("hkdf info too long ({} bytes, maximum 32)", info.len());
                }
                self.key_derivation_type_id = KEY_DERIVATION_TYPE_ID_HKDF_SHA256.to_string();
                self.hkdf_info = info.clone();
                self.encryption_key_salt = *encryption_key_salt;
                self.mac_key_salt = *mac_key_salt;
            }
        }
        Ok(())
    }

    pub fn set_encryption_aes256_gcm(&mut self, initialization_vector: [u8; 32]) {
        self.encryption_type_id = ENCRYPTION_TYPE_ID_AES_256_GCM.to_string();
        self.initialization_vector = initialization_vector;
    }

    /// Serialize magic, generic header and the parameter sections that the
    /// selected type ids call for. All format versions are currently 0;
    /// the MAC section has no parameters for any supported type.
    pub fn header_block(&self) -> Vec<u8> {
        let mut block = Vec::with_capacity(
            4 + GENERIC_HEADER_LENGTH + HKDF_SHA256_PARAMETERS_LENGTH + AES_256_GCM_PARAMETERS_LENGTH,
        );
        block.extend_from_slice(&BUNDLE_MAGIC);

        // GenericHeader
        block.push(0); // generic_header_format_version
        push_type_id(&mut block, &self.key_derivation_type_id);
        block.push(0); // key_derivation_parameters_format_version
        push_type_id(&mut block, &self.encryption_type_id);
        block.push(0); // encryption_parameters_format_version
        push_type_id(&mut block, MAC_TYPE_ID_NONE);
        block.push(0); // mac_parameters_format_version

        match self.key_derivation_type_id.as_str() {
            KEY_DERIVATION_TYPE_ID_PBKDF2 => {
                block.push(self.pbkdf2_iteration_count_exponent);
                block.extend_from_slice(&self.encryption_key_salt);
                block.extend_from_slice(&self.mac_key_salt);
            }
            KEY_DERIVATION_TYPE_ID_HKDF_SHA256 => {
                block.push(self.hkdf_info.len() as u8);
                let mut info = [0u8; 32];
                info[..self.hkdf_info.len()].copy_from_slice(&self.hkdf_info);
                block.extend_from_slice(&info);
                block.extend_from_slice(&self.encryption_key_salt);
                block.extend_from_slice(&self.mac_key_salt);
            }
            _ => {}
        }

        if self.encryption_type_id == ENCRYPTION_TYPE_ID_AES_256_GCM {
            block.extend_from_slice(&self.initialization_vector);
        }

        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_lengths() {
        let mut headers = EncryptedFileHeaders::new();
        headers.set_key_derivation(&KeyDerivation::None).unwrap();
        headers.set_encryption_aes256_gcm([3u8; 32]);
        assert_eq!(
            headers.header_block().len(),
            4 + GENERIC_HEADER_LENGTH + AES_256_GCM_PARAMETERS_LENGTH
        );

        let mut headers = EncryptedFileHeaders::new();
        headers
            .set_key_derivation(&KeyDerivation::Pbkdf2 {
                iteration_count_exponent: 20,
                encryption_key_salt: [1u8; 32],
                mac_key_salt: [2u8; 32],
            })
            .unwrap();
        headers.set_encryption_aes256_gcm([3u8; 32]);
        assert_eq!(
            headers.header_block().len(),
            4 + GENERIC_HEADER_LENGTH + PBKDF2_PARAMETERS_LENGTH + AES_256_GCM_PARAMETERS_LENGTH
        );

        let mut headers = EncryptedFileHeaders::new();
        headers
            .set_key_derivation(&KeyDerivation::HkdfSha256 {
                info: Vec::new(),
                encryption_key_salt: [1u8; 32],
                mac_key_salt: [2u8; 32],
            })
            .unwrap();
        headers.set_encryption_aes256_gcm([3u8; 32]);
        assert_eq!(
            headers.header_block().len(),
            4 + GENERIC_HEADER_LENGTH + HKDF_SHA256_PARAMETERS_LENGTH + AES_256_GCM_PARAMETERS_LENGTH
        );
    }

    #[test]
    fn header_block_layout() {
        let mut headers = EncryptedFileHeaders::new();
        headers
            .set_key_derivation(&KeyDerivation::Pbkdf2 {
                iteration_count_exponent: 20,
                encryption_key_salt: [0xaa; 32],
                mac_key_salt: [0xbb; 32],
            })
            .unwrap();
        headers.set_encryption_aes256_gcm([0xcc; 32]);
        let block = headers.header_block();

        assert_eq!(&block[0..4], b"PEX\0");
        assert_eq!(block[4], 0);
        assert_eq!(&block[5..11], b"pbkdf2");
        assert_eq!(&block[11..20], &[0u8; 9]);
        assert_eq!(&block[21..32], b"aes-256-gcm");
        // mac type id is all NULs
        assert_eq!(&block[37..52], &[0u8; 15]);
        // pbkdf2 parameters follow the generic header
        let params = 4 + GENERIC_HEADER_LENGTH;
        assert_eq!(block[params], 20);
        assert_eq!(&block[params + 1..params + 33], &[0xaa; 32]);
        assert_eq!(&block[params + 33..params + 65], &[0xbb; 32]);
        // the iv is the final section
        assert_eq!(&block[block.len() - 32..], &[0xcc; 32]);
    }

    #[test]
    fn bad_hkdf_info_rejected() {
        let mut headers = EncryptedFileHeaders::new();
        let result = headers.set_key_derivation(&KeyDerivation::HkdfSha256 {
            info: vec![0u8; 33],
            encryption_key_salt: [0u8; 32],
            mac_key_salt: [0u8; 32],
        });
        assert!(result.is_err());
    }
}

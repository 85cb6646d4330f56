//! Key material handling for Polar Express.
//!
//! Derives the (encryption key, MAC key) pair used by the bundle cryptor,
//! either from a passphrase (PBKDF2-SHA256) or from a raw master key file
//! (HKDF-SHA-256, RFC 5869), and loads AWS credentials. Once derivation has
//! run, the master key is no longer needed in memory unless the user opted
//! into encrypting with it directly.

use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use anyhow::{bail, format_err, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::pkey::PKey;
use openssl::sign::Signer;

/// AES-256 key length; also the length of derivation salts.
pub const KEY_LENGTH: usize = 32;
pub const SALT_LENGTH: usize = 32;

/// AWS credential sizes, fixed by the service.
pub const AWS_ACCESS_KEY_LENGTH: usize = 20;
pub const AWS_SECRET_KEY_LENGTH: usize = 40;

/// PBKDF2 runs 2^N iterations; this is N.
pub const PBKDF2_ITERATIONS_EXPONENT: u8 = 20;

/// How the cipher keys were derived. Carried into the bundle file headers
/// so a future reader can re-derive the same keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyDerivation {
    /// Master key used directly, nothing to re-derive.
    None,
    Pbkdf2 {
        iteration_count_exponent: u8,
        encryption_key_salt: [u8; SALT_LENGTH],
        mac_key_salt: [u8; SALT_LENGTH],
    },
    HkdfSha256 {
        info: Vec<u8>,
        encryption_key_salt: [u8; SALT_LENGTH],
        mac_key_salt: [u8; SALT_LENGTH],
    },
}

/// The derived keys plus the parameters needed to describe the derivation
/// in a bundle header. Shared read-only by all bundle state machines.
#[derive(Clone)]
pub struct KeyingData {
    pub encryption_key: [u8; KEY_LENGTH],
    pub mac_key: [u8; KEY_LENGTH],
    pub derivation: KeyDerivation,
}

impl KeyingData {
    /// Derive independent encryption and MAC keys from a passphrase with
    /// PBKDF2-SHA256 and fresh random salts.
    pub fn from_passphrase(passphrase: &[u8]) -> Result<Self, Error> {
        let iterations = 1usize << PBKDF2_ITERATIONS_EXPONENT;

        let mut encryption_key_salt = [0u8; SALT_LENGTH];
        openssl::rand::rand_bytes(&mut encryption_key_salt)?;
        let mut encryption_key = [0u8; KEY_LENGTH];
        pbkdf2_hmac(
            passphrase,
            &encryption_key_salt,
            iterations,
            MessageDigest::sha256(),
            &mut encryption_key,
        )?;

        let mut mac_key_salt = [0u8; SALT_LENGTH];
        openssl::rand::rand_bytes(&mut mac_key_salt)?;
        let mut mac_key = [0u8; KEY_LENGTH];
        pbkdf2_hmac(
            passphrase,
            &mac_key_salt,
            iterations,
            MessageDigest::sha256(),
            &mut mac_key,
        )?;

        Ok(Self {
            encryption_key,
            mac_key,
            derivation: KeyDerivation::Pbkdf2 {
                iteration_count_exponent: PBKDF2_ITERATIONS_EXPONENT,
                encryption_key_salt,
                mac_key_salt,
            },
        })
    }

    /// Derive keys from a raw master key. With `encrypt_with_master_key`
    /// the master key itself becomes the encryption key and no derivation
    /// header is written; otherwise HKDF-SHA-256 with fresh random salts
    /// produces two independent keys.
    pub fn from_master_key(
        master_key: &[u8],
        encrypt_with_master_key: bool,
    ) -> Result<Self, Error> {
        if encrypt_with_master_key {
            if master_key.len() != KEY_LENGTH {
                bail!(
                    "master key must be exactly {} bytes to be used directly, got {}",
                    KEY_LENGTH,
                    master_key.len()
                );
            }
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(master_key);
            return Ok(Self {
                encryption_key: key,
                mac_key: key,
                derivation: KeyDerivation::None,
            });
        }

        // Fixed empty info, per RFC 5869 this does not weaken the expand
        // step.
        let info: &[u8] = b"";

        let mut encryption_key_salt = [0u8; SALT_LENGTH];
        openssl::rand::rand_bytes(&mut encryption_key_salt)?;
        let mut encryption_key = [0u8; KEY_LENGTH];
        hkdf_sha256(master_key, &encryption_key_salt, info, &mut encryption_key)?;

        let mut mac_key_salt = [0u8; SALT_LENGTH];
        openssl::rand::rand_bytes(&mut mac_key_salt)?;
        let mut mac_key = [0u8; KEY_LENGTH];
        hkdf_sha256(master_key, &mac_key_salt, info, &mut mac_key)?;

        Ok(Self {
            encryption_key,
            mac_key,
            derivation: KeyDerivation::HkdfSha256 {
                info: info.to_vec(),
                encryption_key_salt,
                mac_key_salt,
            },
        })
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], Error> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    for part in parts {
        signer.update(part)?;
    }
    let mut out = [0u8; 32];
    signer.sign(&mut out)?;
    Ok(out)
}

/// HKDF as defined by RFC 5869 with SHA-256.
///
/// Extract uses the salt as HMAC key over the input key material; expand
/// iterates T(i) = HMAC(prk, T(i-1) || info || i) until `out` is filled.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), Error> {
    if out.len() > 255 * 32 {
        bail!("hkdf output length too large ({} bytes)", out.len());
    }

    let prk = hmac_sha256(salt, &[ikm])?;

    let mut previous: Vec<u8> = Vec::new();
    let mut filled = 0;
    let mut counter: u8 = 1;
    while filled < out.len() {
        let t = hmac_sha256(&prk, &[&previous, info, &[counter]])?;
        let take = (out.len() - filled).min(t.len());
        out[filled..filled + take].copy_from_slice(&t[..take]);
        filled += take;
        previous = t.to_vec();
        counter += 1;
    }
    Ok(())
}

fn check_owner_only(path: &Path, what: &str) -> Result<(), Error> {
    let metadata = std::fs::metadata(path)
        .map_err(|err| format_err!("unable to stat {} file {:?} - {}", what, path, err))?;
    if metadata.permissions().mode() & 0o077 != 0 {
        bail!(
            "permissions on {} file {:?} are too open - it must be readable only by its owner",
            what,
            path
        );
    }
    Ok(())
}

fn load_key_file(path: &Path, expected_length: usize, what: &str) -> Result<Vec<u8>, Error> {
    check_owner_only(path, what)?;
    let data = std::fs::read(path)
        .map_err(|err| format_err!("unable to read {} file {:?} - {}", what, path, err))?;
    if data.len() != expected_length {
        bail!(
            "{} file {:?} has wrong length - expected {} bytes, got {} (check for a trailing newline)",
            what,
            path,
            expected_length,
            data.len()
        );
    }
    Ok(data)
}

/// Load a raw binary master key from an owner-read-only file.
pub fn load_master_key(path: &Path) -> Result<Vec<u8>, Error> {
    load_key_file(path, KEY_LENGTH, "master key")
}

/// Generate a fresh random master key at `path`. Refuses to overwrite an
/// existing file; the result is left owner-read-only.
pub fn generate_master_key(path: &Path) -> Result<Vec<u8>, Error> {
    if path.exists() {
        bail!(
            "refusing to generate a new master key at {:?} - the file already exists",
            path
        );
    }

    let mut key = vec![0u8; KEY_LENGTH];
    openssl::rand::rand_bytes(&mut key)?;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| format_err!("unable to create master key file {:?} - {}", path, err))?;
    file.write_all(&key)?;
    file.sync_all()?;
    drop(file);
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))?;

    log::info!("generated new master key at {:?}", path);
    Ok(key)
}

/// Load the AWS secret key from an owner-read-only file.
pub fn load_aws_secret_key(path: &Path) -> Result<Vec<u8>, Error> {
    load_key_file(path, AWS_SECRET_KEY_LENGTH, "AWS secret key")
}

/// Validate the fixed length of an AWS access key id.
pub fn check_aws_access_key(access_key: &str) -> Result<(), Error> {
    if access_key.len() != AWS_ACCESS_KEY_LENGTH {
        bail!(
            "AWS access key has wrong length - expected {} characters, got {}",
            AWS_ACCESS_KEY_LENGTH,
            access_key.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_rfc5869_test_case_1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let mut okm = [0u8; 42];
        hkdf_sha256(&ikm, &salt, &info, &mut okm).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf\
             34007208d5b887185865"
        );
    }

    #[test]
    fn pbkdf2_known_vector() {
        // PBKDF2-HMAC-SHA256("password", "salt", 1 iteration)
        let mut out = [0u8; 32];
        pbkdf2_hmac(b"password", b"salt", 1, MessageDigest::sha256(), &mut out).unwrap();
        assert_eq!(
            hex::encode(out),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn passphrase_derivation_uses_distinct_salts() {
        let keying = KeyingData::from_passphrase(b"hunter2").unwrap();
        match keying.derivation {
            KeyDerivation::Pbkdf2 {
                iteration_count_exponent,
                encryption_key_salt,
                mac_key_salt,
            } => {
                assert_eq!(iteration_count_exponent, PBKDF2_ITERATIONS_EXPONENT);
                assert_ne!(encryption_key_salt, mac_key_salt);
            }
            other => panic!("unexpected derivation {:?}", other),
        }
        assert_ne!(keying.encryption_key, keying.mac_key);
    }

    #[test]
    fn direct_master_key_has_no_derivation() {
        let master = [7u8; KEY_LENGTH];
        let keying = KeyingData::from_master_key(&master, true).unwrap();
        assert_eq!(keying.derivation, KeyDerivation::None);
        assert_eq!(keying.encryption_key, master);
    }

    #[test]
    fn direct_master_key_rejects_bad_length() {
        assert!(KeyingData::from_master_key(&[7u8; 16], true).is_err());
    }

    #[test]
    fn master_key_hkdf_derivation() {
        let master = [9u8; KEY_LENGTH];
        let keying = KeyingData::from_master_key(&master, false).unwrap();
        assert!(matches!(keying.derivation, KeyDerivation::HkdfSha256 { .. }));
        assert_ne!(keying.encryption_key, keying.mac_key);
        assert_ne!(keying.encryption_key, master);
    }

    #[test]
    fn generate_master_key_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let key = generate_master_key(&path).unwrap();
        assert_eq!(key.len(), KEY_LENGTH);
        assert_eq!(load_master_key(&path).unwrap(), key);
        assert!(generate_master_key(&path).is_err());
    }

    #[test]
    fn key_file_permission_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaky.key");
        std::fs::write(&path, [1u8; KEY_LENGTH]).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(load_master_key(&path).is_err());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert!(load_master_key(&path).is_ok());
    }
}

//! Command line options and their validation.
//!
//! All configuration problems (missing keys, malformed credentials, bad
//! key-file permissions) are reported before the pipeline starts; the
//! binary exits non-zero without touching the catalog or the service.

use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::Parser;

use pex_key_config::KeyingData;

use crate::bundle_stage::{
    BundleStageConfig, DEFAULT_MAX_BUNDLE_BYTES, DEFAULT_MAX_PENDING_BUNDLE_BYTES,
    DEFAULT_MAX_SIMULTANEOUS_BUNDLES, DEFAULT_MAX_UPSTREAM_IDLE_SECONDS,
};
use crate::upload_stage::{
    UploadStageConfig, DEFAULT_MAX_PENDING_BUNDLES, DEFAULT_MAX_SIMULTANEOUS_UPLOADS,
};

#[derive(Parser, Debug)]
#[command(
    name = "polar-express",
    version,
    about = "Encrypted, deduplicating directory backup to Amazon Glacier"
)]
pub struct Args {
    /// Local path to back up.
    pub backup_root: PathBuf,

    /// Passphrase for encrypting backups (PBKDF2 key derivation).
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Path to a raw binary master key file (must be owner-readable
    /// only). The passphrase is ignored when this is set.
    #[arg(long = "master_key_file")]
    pub master_key_file: Option<PathBuf>,

    /// Generate a new random master key at --master_key_file. Refuses
    /// to overwrite an existing file.
    #[arg(long = "generate_new_master_key", default_value_t = false)]
    pub generate_new_master_key: bool,

    /// Use the master key directly for encryption instead of deriving
    /// session keys from it.
    #[arg(long = "encrypt_with_master_key", default_value_t = false)]
    pub encrypt_with_master_key: bool,

    /// Amazon Web Services region (e.g. 'us-west-2').
    #[arg(long = "aws_region_name")]
    pub aws_region_name: Option<String>,

    /// Amazon Web Services access key.
    #[arg(long = "aws_access_key")]
    pub aws_access_key: Option<String>,

    /// Path to the AWS secret key file (must be owner-readable only).
    #[arg(long = "aws_secret_key_file")]
    pub aws_secret_key_file: Option<PathBuf>,

    /// Name of the Glacier vault in which to store backups.
    #[arg(long = "aws_glacier_vault_name")]
    pub aws_glacier_vault_name: Option<String>,

    /// Compression level for bundle payloads.
    #[arg(long = "zlib_compression_level", default_value_t = 9)]
    pub zlib_compression_level: u32,

    /// Maximum total size of snapshots waiting to bundle.
    #[arg(long = "max_pending_bundle_bytes", default_value_t = DEFAULT_MAX_PENDING_BUNDLE_BYTES)]
    pub max_pending_bundle_bytes: u64,

    /// Size at which a bundle is finalized and handed to the uploader.
    #[arg(long = "max_bundle_size_bytes", default_value_t = DEFAULT_MAX_BUNDLE_BYTES)]
    pub max_bundle_size_bytes: usize,

    /// Number of bundles built concurrently.
    #[arg(long = "max_simultaneous_bundles", default_value_t = DEFAULT_MAX_SIMULTANEOUS_BUNDLES)]
    pub max_simultaneous_bundles: usize,

    /// Seconds of upstream idleness before a partial bundle is flushed.
    #[arg(long = "max_upstream_idle_time_seconds", default_value_t = DEFAULT_MAX_UPSTREAM_IDLE_SECONDS)]
    pub max_upstream_idle_time_seconds: i64,

    /// Use TLS for connections to the archive service.
    #[arg(long = "use_ssl", default_value_t = true, action = clap::ArgAction::Set)]
    pub use_ssl: bool,
}

/// Everything the backup executor needs, validated.
pub struct Config {
    pub backup_root: PathBuf,
    pub keying: KeyingData,
    pub bundle_config: BundleStageConfig,
    pub upload_config: UploadStageConfig,
}

impl Args {
    /// Validate the options, load key material, and produce the runtime
    /// configuration. The master key leaves memory once derivation has
    /// run, unless the user opted into encrypting with it directly.
    pub fn into_config(self) -> Result<Config, Error> {
        let keying = match &self.master_key_file {
            Some(master_key_file) => {
                let master_key = if self.generate_new_master_key {
                    pex_key_config::generate_master_key(master_key_file)?
                } else {
                    pex_key_config::load_master_key(master_key_file)?
                };
                KeyingData::from_master_key(&master_key, self.encrypt_with_master_key)?
            }
            None => {
                if self.generate_new_master_key {
                    bail!(
                        "asked to generate a new master key, but no --master_key_file specified"
                    );
                }
                match &self.passphrase {
                    Some(passphrase) if !passphrase.is_empty() => {
                        KeyingData::from_passphrase(passphrase.as_bytes())?
                    }
                    _ => bail!(
                        "no key material: specify --passphrase or --master_key_file"
                    ),
                }
            }
        };

        let aws_region_name = match self.aws_region_name {
            Some(region) if !region.is_empty() => region,
            _ => bail!("--aws_region_name is required"),
        };
        let aws_access_key = match self.aws_access_key {
            Some(access_key) => {
                pex_key_config::check_aws_access_key(&access_key)?;
                access_key
            }
            None => bail!("--aws_access_key is required"),
        };
        let aws_secret_key = match self.aws_secret_key_file {
            Some(path) => pex_key_config::load_aws_secret_key(&path)?,
            None => bail!("--aws_secret_key_file is required"),
        };
        let vault_name = match self.aws_glacier_vault_name {
            Some(vault) if !vault.is_empty() => vault,
            _ => bail!("--aws_glacier_vault_name is required"),
        };

        if self.zlib_compression_level > 9 {
            bail!(
                "--zlib_compression_level must be between 0 and 9, got {}",
                self.zlib_compression_level
            );
        }
        if self.max_bundle_size_bytes == 0 || self.max_simultaneous_bundles == 0 {
            bail!("bundle size and concurrency bounds must be positive");
        }

        if !self.backup_root.is_dir() {
            bail!("backup root {:?} is not a directory", self.backup_root);
        }

        let bundle_config = BundleStageConfig {
            max_bundle_bytes: self.max_bundle_size_bytes,
            max_pending_bundle_bytes: self.max_pending_bundle_bytes,
            max_simultaneous_bundles: self.max_simultaneous_bundles,
            max_upstream_idle_seconds: self.max_upstream_idle_time_seconds,
            compression_level: self.zlib_compression_level,
            ..Default::default()
        };

        let upload_config = UploadStageConfig {
            aws_region_name,
            aws_access_key,
            aws_secret_key,
            vault_name,
            use_ssl: self.use_ssl,
            max_pending_bundles: DEFAULT_MAX_PENDING_BUNDLES,
            max_simultaneous_uploads: DEFAULT_MAX_SIMULTANEOUS_UPLOADS,
        };

        Ok(Config {
            backup_root: self.backup_root,
            keying,
            bundle_config,
            upload_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(dir: &std::path::Path, secret: &std::path::Path) -> Vec<String> {
        vec![
            "polar-express".to_string(),
            dir.to_string_lossy().into_owned(),
            "--passphrase=opensesame".to_string(),
            "--aws_region_name=us-east-1".to_string(),
            "--aws_access_key=AKIDEXAMPLEACCESSKEY".to_string(),
            format!("--aws_secret_key_file={}", secret.display()),
            "--aws_glacier_vault_name=backups".to_string(),
        ]
    }

    fn write_secret(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("secret.key");
        std::fs::write(&path, [7u8; 40]).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        path
    }

    #[test]
    fn valid_args_produce_config() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_secret(dir.path());
        let args = Args::parse_from(base_args(dir.path(), &secret));
        let config = args.into_config().unwrap();
        assert_eq!(config.upload_config.vault_name, "backups");
        assert_eq!(config.bundle_config.max_bundle_bytes, DEFAULT_MAX_BUNDLE_BYTES);
    }

    #[test]
    fn missing_key_material_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_secret(dir.path());
        let mut argv = base_args(dir.path(), &secret);
        argv.retain(|arg| !arg.starts_with("--passphrase"));
        let args = Args::parse_from(argv);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn bad_access_key_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_secret(dir.path());
        let mut argv = base_args(dir.path(), &secret);
        argv.retain(|arg| !arg.starts_with("--aws_access_key"));
        argv.push("--aws_access_key=short".to_string());
        let args = Args::parse_from(argv);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn generate_key_requires_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_secret(dir.path());
        let mut argv = base_args(dir.path(), &secret);
        argv.push("--generate_new_master_key".to_string());
        let args = Args::parse_from(argv);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn master_key_generation_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let secret = write_secret(dir.path());
        let key_path = dir.path().join("master.key");
        let mut argv = base_args(dir.path(), &secret);
        argv.retain(|arg| !arg.starts_with("--passphrase"));
        argv.push(format!("--master_key_file={}", key_path.display()));
        argv.push("--generate_new_master_key".to_string());
        let args = Args::parse_from(argv);
        let config = args.into_config().unwrap();
        assert!(key_path.exists());
        assert!(matches!(
            config.keying.derivation,
            pex_key_config::KeyDerivation::HkdfSha256 { .. }
        ));
    }
}

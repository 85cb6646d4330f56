//! Vault and archive operations against the Glacier API.
//!
//! One operation is in flight at a time per client; operations fail fast
//! when the connection is not open. Transport failures close the
//! connection, and the caller decides when to reopen and retry.

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use hyper::{Body, Request};
use serde::Deserialize;

use crate::http_connection::HttpConnection;
use crate::signing;

const SERVICE_NAME: &str = "glacier";
const AWS_DOMAIN: &str = "amazonaws.com";
const GLACIER_VERSION_HEADER: &str = "x-amz-glacier-version";
const GLACIER_VERSION: &str = "2012-06-01";
const ARCHIVE_ID_HEADER: &str = "x-amz-archive-id";
const TREE_HASH_HEADER: &str = "x-amz-sha256-tree-hash";
const CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";
const ARCHIVE_DESCRIPTION_HEADER: &str = "x-amz-archive-description";
const VAULT_PATH_PREFIX: &str = "/-/vaults";

const MAX_DESCRIPTION_LENGTH: usize = 1024;

/// SHA-256 of the empty string; payload digest for bodyless requests.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VaultDescription {
    #[serde(rename = "CreationDate", default)]
    pub creation_date: Option<String>,
    #[serde(rename = "LastInventoryDate", default)]
    pub last_inventory_date: Option<String>,
    #[serde(rename = "NumberOfArchives", default)]
    pub number_of_archives: i64,
    #[serde(rename = "SizeInBytes", default)]
    pub size_in_bytes: i64,
    #[serde(rename = "VaultARN", default)]
    pub vault_arn: String,
    #[serde(rename = "VaultName", default)]
    pub vault_name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VaultList {
    #[serde(rename = "VaultList", default)]
    pub vaults: Vec<VaultDescription>,
    #[serde(rename = "Marker", default)]
    pub marker: Option<String>,
}

pub struct GlacierClient {
    connection: HttpConnection,
    region: String,
    access_key: String,
    secret_key: Vec<u8>,
    last_operation_succeeded: bool,
}

impl GlacierClient {
    pub fn new(region: String, access_key: String, secret_key: Vec<u8>, use_tls: bool) -> Self {
        let hostname = format!("{}.{}.{}", SERVICE_NAME, region, AWS_DOMAIN);
        Self {
            connection: HttpConnection::new(hostname, use_tls),
            region,
            access_key,
            secret_key,
            last_operation_succeeded: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn last_operation_succeeded(&self) -> bool {
        self.last_operation_succeeded
    }

    pub async fn open(&mut self) -> Result<(), Error> {
        self.connection.open().await
    }

    pub fn close(&mut self) {
        self.connection.close();
    }

    pub async fn reopen(&mut self) -> Result<(), Error> {
        self.connection.close();
        self.connection.open().await
    }

    /// Describe a vault. `Ok(None)` means the vault does not exist.
    pub async fn describe_vault(
        &mut self,
        vault_name: &str,
    ) -> Result<Option<VaultDescription>, Error> {
        let path = format!("{}/{}", VAULT_PATH_PREFIX, vault_name);
        let (status, _headers, body) = self
            .send("GET", &path, &[], Vec::new(), Vec::new(), EMPTY_PAYLOAD_SHA256)
            .await?;

        if status == http::StatusCode::NOT_FOUND {
            self.last_operation_succeeded = true;
            return Ok(None);
        }
        if !status.is_success() {
            bail!(
                "DescribeVault {:?} failed with status {} - {}",
                vault_name,
                status,
                String::from_utf8_lossy(&body)
            );
        }
        let description: VaultDescription = serde_json::from_slice(&body)
            .map_err(|err| format_err!("unparseable vault description - {}", err))?;
        self.last_operation_succeeded = true;
        Ok(Some(description))
    }

    /// Create a vault. Returns true once the vault exists.
    pub async fn create_vault(&mut self, vault_name: &str) -> Result<bool, Error> {
        let path = format!("{}/{}", VAULT_PATH_PREFIX, vault_name);
        let (status, _headers, body) = self
            .send("PUT", &path, &[], Vec::new(), Vec::new(), EMPTY_PAYLOAD_SHA256)
            .await?;
        if !status.is_success() {
            bail!(
                "CreateVault {:?} failed with status {} - {}",
                vault_name,
                status,
                String::from_utf8_lossy(&body)
            );
        }
        self.last_operation_succeeded = true;
        Ok(true)
    }

    /// List up to `max_vaults` vaults starting at `start_marker`.
    pub async fn list_vaults(
        &mut self,
        max_vaults: usize,
        start_marker: Option<&str>,
    ) -> Result<VaultList, Error> {
        if max_vaults == 0 || max_vaults > 1000 {
            bail!("max_vaults must be between 1 and 1000, got {}", max_vaults);
        }
        let mut query = vec![("limit".to_string(), max_vaults.to_string())];
        if let Some(marker) = start_marker {
            if !marker.is_empty() {
                query.push(("marker".to_string(), marker.to_string()));
            }
        }

        let (status, _headers, body) = self
            .send(
                "GET",
                VAULT_PATH_PREFIX,
                &query,
                Vec::new(),
                Vec::new(),
                EMPTY_PAYLOAD_SHA256,
            )
            .await?;
        if !status.is_success() {
            bail!(
                "ListVaults failed with status {} - {}",
                status,
                String::from_utf8_lossy(&body)
            );
        }
        let list: VaultList = serde_json::from_slice(&body)
            .map_err(|err| format_err!("unparseable vault list - {}", err))?;
        self.last_operation_succeeded = true;
        Ok(list)
    }

    /// Delete a vault. Returns true once the vault is gone.
    pub async fn delete_vault(&mut self, vault_name: &str) -> Result<bool, Error> {
        let path = format!("{}/{}", VAULT_PATH_PREFIX, vault_name);
        let (status, _headers, body) = self
            .send(
                "DELETE",
                &path,
                &[],
                Vec::new(),
                Vec::new(),
                EMPTY_PAYLOAD_SHA256,
            )
            .await?;
        if !status.is_success() {
            bail!(
                "DeleteVault {:?} failed with status {} - {}",
                vault_name,
                status,
                String::from_utf8_lossy(&body)
            );
        }
        self.last_operation_succeeded = true;
        Ok(true)
    }

    /// Upload an archive from sequential payload buffers. Returns the
    /// service-assigned archive id.
    pub async fn upload_archive(
        &mut self,
        vault_name: &str,
        sequential_payload: Vec<Bytes>,
        payload_sha256_linear_digest: &str,
        payload_sha256_tree_digest: &str,
        payload_description: &str,
    ) -> Result<String, Error> {
        if payload_description.len() > MAX_DESCRIPTION_LENGTH
            || !payload_description
                .bytes()
                .all(|b| (0x20..=0x7e).contains(&b))
        {
            bail!("archive description must be at most 1024 printable ASCII characters");
        }

        let path = format!("{}/{}/archives", VAULT_PATH_PREFIX, vault_name);
        let headers = vec![
            (
                ARCHIVE_DESCRIPTION_HEADER.to_string(),
                payload_description.to_string(),
            ),
            (
                TREE_HASH_HEADER.to_string(),
                payload_sha256_tree_digest.to_ascii_lowercase(),
            ),
        ];

        let (status, response_headers, body) = self
            .send(
                "POST",
                &path,
                &[],
                headers,
                sequential_payload,
                payload_sha256_linear_digest,
            )
            .await?;
        if !status.is_success() {
            bail!(
                "UploadArchive to {:?} failed with status {} - {}",
                vault_name,
                status,
                String::from_utf8_lossy(&body)
            );
        }

        let archive_id = response_headers
            .get(ARCHIVE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if archive_id.is_empty() {
            bail!("UploadArchive succeeded but returned no archive id");
        }
        self.last_operation_succeeded = true;
        Ok(archive_id)
    }

    /// Delete an archive. Returns true once the archive is gone.
    pub async fn delete_archive(
        &mut self,
        vault_name: &str,
        archive_id: &str,
    ) -> Result<bool, Error> {
        let path = format!(
            "{}/{}/archives/{}",
            VAULT_PATH_PREFIX, vault_name, archive_id
        );
        let (status, _headers, body) = self
            .send(
                "DELETE",
                &path,
                &[],
                Vec::new(),
                Vec::new(),
                EMPTY_PAYLOAD_SHA256,
            )
            .await?;
        if !status.is_success() {
            bail!(
                "DeleteArchive {:?} failed with status {} - {}",
                archive_id,
                status,
                String::from_utf8_lossy(&body)
            );
        }
        self.last_operation_succeeded = true;
        Ok(true)
    }

    async fn send(
        &mut self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        mut headers: Vec<(String, String)>,
        payload: Vec<Bytes>,
        payload_sha256_digest: &str,
    ) -> Result<(http::StatusCode, http::HeaderMap, Vec<u8>), Error> {
        if !self.connection.is_open() {
            bail!("glacier connection is not open");
        }
        self.last_operation_succeeded = false;

        let payload_digest = payload_sha256_digest.to_ascii_lowercase();
        headers.push((GLACIER_VERSION_HEADER.to_string(), GLACIER_VERSION.to_string()));
        headers.push((CONTENT_SHA256_HEADER.to_string(), payload_digest.clone()));

        let timestamp = signing::canonical_timestamp_now();
        let authorization = signing::authorize_request(
            &self.secret_key,
            &self.access_key,
            &self.region,
            SERVICE_NAME,
            &payload_digest,
            &timestamp,
            method,
            path,
            query,
            &mut headers,
            self.connection.hostname(),
        )?;

        let mut uri = signing::normalize_path(path);
        if !query.is_empty() {
            let query_string = query
                .iter()
                .map(|(k, v)| format!("{}={}", signing::uri_encode(k), signing::uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            uri = format!("{}?{}", uri, query_string);
        }

        let content_length: u64 = payload.iter().map(|part| part.len() as u64).sum();
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", self.connection.hostname())
            .header("authorization", authorization)
            .header("content-length", content_length);
        for (key, value) in &headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let body = if payload.is_empty() {
            Body::empty()
        } else {
            Body::wrap_stream(futures::stream::iter(
                payload.into_iter().map(Ok::<_, std::io::Error>),
            ))
        };
        let request = builder
            .body(body)
            .map_err(|err| format_err!("unable to build request - {}", err))?;

        let (response, body) = self.connection.send_request(request).await?;
        let status = response.status();
        Ok((status, response.headers().clone(), body))
    }
}

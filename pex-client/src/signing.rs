//! AWS Signature Version 4 request signing.
//!
//! The canonical request, signing string and key derivation chain follow
//! the AWS general reference. Query keys and header names are sorted in
//! strict ASCII order; a duplicated query key has no defined ordering and
//! is rejected outright.

use std::collections::BTreeMap;

use anyhow::{bail, Error};
use chrono::{NaiveDateTime, Utc};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const ALGORITHM_ID: &str = "AWS4-HMAC-SHA256";
const TERMINATION_STRING: &str = "aws4_request";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

// RFC 3986 unreserved characters stay literal; everything else is
// percent-encoded with uppercase hex, "%20" not "+".
const STRICT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// URI-encode a string the way SigV4 canonicalisation requires.
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, STRICT_ENCODE_SET).to_string()
}

/// Normalize a URI path into encoded segments joined by `/`.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical timestamp for the current time: ISO 8601 basic format, UTC.
pub fn canonical_timestamp_now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

fn canonical_date(canonical_timestamp: &str) -> Result<String, Error> {
    let parsed = NaiveDateTime::parse_from_str(canonical_timestamp, TIMESTAMP_FORMAT)
        .map_err(|err| {
            anyhow::format_err!(
                "unparseable canonical timestamp {:?} - {}",
                canonical_timestamp,
                err
            )
        })?;
    Ok(parsed.format("%Y%m%d").to_string())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], Error> {
    let pkey = PKey::hmac(key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(data)?;
    let mut out = [0u8; 32];
    signer.sign(&mut out)?;
    Ok(out)
}

/// Build the canonical request string. Returns the canonical request and
/// the `;`-joined signed header list. The `host` header is implicit;
/// callers pass the remaining headers exactly as they will appear on the
/// wire.
pub fn make_canonical_request(
    method: &str,
    path: &str,
    query_parameters: &[(String, String)],
    request_headers: &[(String, String)],
    hostname: &str,
    payload_sha256_digest: &str,
) -> Result<(String, String), Error> {
    let mut canonical_query: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in query_parameters {
        if canonical_query
            .insert(uri_encode(key), uri_encode(value))
            .is_some()
        {
            bail!("duplicate query parameter key {:?}", key);
        }
    }

    let mut canonical_headers: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in request_headers {
        if canonical_headers
            .insert(key.to_ascii_lowercase(), value.trim().to_string())
            .is_some()
        {
            bail!("duplicate request header {:?}", key);
        }
    }
    if canonical_headers
        .insert("host".to_string(), hostname.trim().to_string())
        .is_some()
    {
        bail!("explicit host header conflicts with hostname");
    }

    let signed_headers = canonical_headers
        .keys()
        .cloned()
        .collect::<Vec<_>>()
        .join(";");

    let canonical_query_string = canonical_query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    // The canonical headers section carries a trailing newline of its
    // own, then another newline separates it from the signed headers.
    let canonical_headers_string = canonical_headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n";

    let canonical_request = [
        method,
        &normalize_path(path),
        &canonical_query_string,
        &canonical_headers_string,
        &signed_headers,
        &payload_sha256_digest.to_ascii_lowercase(),
    ]
    .join("\n");

    Ok((canonical_request, signed_headers))
}

/// Build the string to sign from a canonical request.
pub fn make_signing_string(
    region: &str,
    service: &str,
    canonical_timestamp: &str,
    canonical_request: &str,
) -> Result<String, Error> {
    let date = canonical_date(canonical_timestamp)?;
    let credential_scope = [date.as_str(), region, service, TERMINATION_STRING].join("/");
    Ok([
        ALGORITHM_ID,
        canonical_timestamp,
        &credential_scope,
        &sha256_hex(canonical_request.as_bytes()),
    ]
    .join("\n"))
}

/// Derive the signing key chain for a credential scope.
pub fn derive_signing_key(
    secret_key: &[u8],
    region: &str,
    service: &str,
    canonical_timestamp: &str,
) -> Result<[u8; 32], Error> {
    let date = canonical_date(canonical_timestamp)?;
    let mut initial_key = Vec::with_capacity(4 + secret_key.len());
    initial_key.extend_from_slice(b"AWS4");
    initial_key.extend_from_slice(secret_key);

    let k_date = hmac_sha256(&initial_key, date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, TERMINATION_STRING.as_bytes())
}

/// Compute the final signature as lowercase hex.
pub fn make_signature(signing_key: &[u8; 32], signing_string: &str) -> Result<String, Error> {
    Ok(hex::encode(hmac_sha256(
        signing_key,
        signing_string.as_bytes(),
    )?))
}

/// Sign a request: appends `x-amz-date` to `request_headers` and returns
/// the value for the `Authorization` header.
#[allow(clippy::too_many_arguments)]
pub fn authorize_request(
    secret_key: &[u8],
    access_key: &str,
    region: &str,
    service: &str,
    payload_sha256_digest: &str,
    canonical_timestamp: &str,
    method: &str,
    path: &str,
    query_parameters: &[(String, String)],
    request_headers: &mut Vec<(String, String)>,
    hostname: &str,
) -> Result<String, Error> {
    request_headers.push(("x-amz-date".to_string(), canonical_timestamp.to_string()));

    let (canonical_request, signed_headers) = make_canonical_request(
        method,
        path,
        query_parameters,
        request_headers,
        hostname,
        payload_sha256_digest,
    )?;
    let signing_string =
        make_signing_string(region, service, canonical_timestamp, &canonical_request)?;
    let signing_key = derive_signing_key(secret_key, region, service, canonical_timestamp)?;
    let signature = make_signature(&signing_key, &signing_string)?;

    let date = canonical_date(canonical_timestamp)?;
    Ok(format!(
        "{} Credential={}/{}/{}/{}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM_ID, access_key, date, region, service, TERMINATION_STRING,
        signed_headers, signature
    ))
}

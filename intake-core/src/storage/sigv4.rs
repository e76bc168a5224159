//! AWS Signature Version 4 request signing, scoped to the `s3` service.
//!
//! Only what the remote store needs: header-auth signing for PUT/GET/
//! DELETE with a known payload hash, and query-string presigning for
//! time-limited URLs.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub(crate) struct SigningKey<'a> {
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub region: &'a str,
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Canonical URI: each path segment percent-encoded, slashes preserved.
pub(crate) fn canonical_uri(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn scope(date: &str, region: &str) -> String {
    format!("{date}/{region}/s3/aws4_request")
}

fn signature(
    key: &SigningKey<'_>,
    date: &str,
    string_to_sign: &str,
) -> String {
    let k_date = hmac(
        format!("AWS4{}", key.secret_key).as_bytes(),
        date.as_bytes(),
    );
    let k_region = hmac(&k_date, key.region.as_bytes());
    let k_service = hmac(&k_region, b"s3");
    let k_signing = hmac(&k_service, b"aws4_request");
    hex(&hmac(&k_signing, string_to_sign.as_bytes()))
}

fn string_to_sign(
    timestamp: &str,
    date: &str,
    region: &str,
    canonical_request: &str,
) -> String {
    format!(
        "AWS4-HMAC-SHA256\n{timestamp}\n{}\n{}",
        scope(date, region),
        sha256_hex(canonical_request.as_bytes()),
    )
}

/// Header-auth signing. Returns `(authorization, x_amz_date)`; the caller
/// also sends `x-amz-content-sha256: payload_hash` and `host`.
pub(crate) fn sign_headers(
    key: &SigningKey<'_>,
    method: &str,
    host: &str,
    path: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> (String, String) {
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let canonical_request = format!(
        "{method}\n{}\n\nhost:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{timestamp}\n\nhost;x-amz-content-sha256;x-amz-date\n{payload_hash}",
        canonical_uri(path),
    );

    let sig = signature(
        key,
        &date,
        &string_to_sign(&timestamp, &date, key.region, &canonical_request),
    );

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature={sig}",
        key.access_key,
        scope(&date, key.region),
    );
    (authorization, timestamp)
}

/// Query-string presigning with an unsigned payload. Returns the full
/// query string (without leading `?`).
pub(crate) fn presign_query(
    key: &SigningKey<'_>,
    method: &str,
    host: &str,
    path: &str,
    expires_secs: u64,
    now: DateTime<Utc>,
) -> String {
    let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let credential = format!("{}/{}", key.access_key, scope(&date, key.region));

    // Query parameters in canonical (sorted) order.
    let query = format!(
        "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={}&X-Amz-Date={timestamp}&X-Amz-Expires={expires_secs}&X-Amz-SignedHeaders=host",
        urlencoding::encode(&credential),
    );

    let canonical_request = format!(
        "{method}\n{}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}",
        canonical_uri(path),
    );

    let sig = signature(
        key,
        &date,
        &string_to_sign(&timestamp, &date, key.region, &canonical_request),
    );

    format!("{query}&X-Amz-Signature={sig}")
}

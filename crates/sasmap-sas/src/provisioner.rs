//! User delegation SAS provisioning
//!
//! One-shot acquisition of the read-only container token. The signing
//! scheme follows the user delegation SAS layout of the storage REST API:
//! an HMAC-SHA256 over a newline-joined field list, keyed with the
//! delegation key returned by the service.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sasmap_core::ProxySettings;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use crate::credentials::AzureAdCredential;
use crate::error::SasError;
use crate::token::SasToken;

type HmacSha256 = Hmac<Sha256>;

/// Storage REST API version used for requests and embedded in signatures.
const AZURE_API_VERSION: &str = "2023-11-03";

/// How long the minted SAS authorizes reads.
const SAS_VALIDITY_HOURS: i64 = 24;

/// Validity window requested for the delegation key itself. The key only
/// needs to outlive the signing call, but a short window risks clock skew
/// at the service.
const KEY_VALIDITY_HOURS: i64 = 1;

/// Default `sip` restriction: all addresses. Narrow in production via
/// `SAS_IP_RANGE`.
const DEFAULT_IP_RANGE: &str = "0.0.0.0-255.255.255.255";

/// User delegation key response returned by the blob service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserDelegationKey {
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: String,
    pub signed_expiry: String,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64-encoded signing key.
    pub value: String,
}

/// Mints the container-scoped, read-only SAS at process startup.
pub struct SasProvisioner {
    account: String,
    container: String,
    endpoint: String,
    ip_range: String,
    client: reqwest::Client,
}

impl SasProvisioner {
    pub fn new(settings: &ProxySettings) -> Self {
        let ip_range =
            std::env::var("SAS_IP_RANGE").unwrap_or_else(|_| DEFAULT_IP_RANGE.to_string());
        Self {
            account: settings.account.clone(),
            container: settings.container.clone(),
            endpoint: settings.upstream_origin(),
            ip_range,
            client: reqwest::Client::new(),
        }
    }

    /// Authenticate, fetch a delegation key, and sign the token.
    ///
    /// Awaited to completion before the listener binds; any error here
    /// prevents the proxy from serving at all.
    pub async fn provision(&self) -> Result<SasToken, SasError> {
        let credential = AzureAdCredential::new(self.client.clone());
        let bearer = credential.bearer_token().await?;

        let now = Utc::now();
        let key = self
            .user_delegation_key(&bearer, now, now + Duration::hours(KEY_VALIDITY_HOURS))
            .await?;

        let expiry = now + Duration::hours(SAS_VALIDITY_HOURS);
        let token = sign_container_sas(
            &self.account,
            &self.container,
            &key,
            now,
            expiry,
            &self.ip_range,
        )?;

        info!(
            "Provisioned read-only SAS for container {} (expires {})",
            self.container,
            format_time(expiry)
        );
        Ok(token)
    }

    async fn user_delegation_key(
        &self,
        bearer: &str,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<UserDelegationKey, SasError> {
        let url = format!(
            "{}/?restype=service&comp=userdelegationkey",
            self.endpoint
        );
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <KeyInfo><Start>{}</Start><Expiry>{}</Expiry></KeyInfo>",
            format_time(start),
            format_time(expiry)
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SasError::DelegationKey(format!("{}: {}", status, text)));
        }

        let text = response.text().await?;
        let key: UserDelegationKey = quick_xml::de::from_str(&text)?;
        debug!(
            "Obtained user delegation key valid {} - {}",
            key.signed_start, key.signed_expiry
        );
        Ok(key)
    }
}

/// Sign a read-only container SAS with a user delegation key and serialize
/// it to its canonical query-string encoding.
pub(crate) fn sign_container_sas(
    account: &str,
    container: &str,
    key: &UserDelegationKey,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
    ip_range: &str,
) -> Result<SasToken, SasError> {
    let st = format_time(start);
    let se = format_time(expiry);
    let canonical_resource = format!("/blob/{}/{}", account, container);

    let string_to_sign = string_to_sign(
        "r",
        &st,
        &se,
        &canonical_resource,
        key,
        ip_range,
        "https",
        AZURE_API_VERSION,
        "c",
    );

    let key_bytes = BASE64_STANDARD
        .decode(&key.value)
        .map_err(|e| SasError::InvalidKey(format!("key is not valid base64: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| SasError::InvalidKey(e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let pairs: [(&str, &str); 14] = [
        ("sv", AZURE_API_VERSION),
        ("spr", "https"),
        ("st", &st),
        ("se", &se),
        ("sip", ip_range),
        ("sr", "c"),
        ("sp", "r"),
        ("skoid", &key.signed_oid),
        ("sktid", &key.signed_tid),
        ("skt", &key.signed_start),
        ("ske", &key.signed_expiry),
        ("sks", &key.signed_service),
        ("skv", &key.signed_version),
        ("sig", &signature),
    ];

    let query = pairs
        .iter()
        .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    Ok(SasToken::new(query))
}

/// Newline-joined field list for a user delegation SAS (24 fields for
/// service versions 2020-12-06 and later). Unused fields stay empty.
#[allow(clippy::too_many_arguments)]
fn string_to_sign(
    permissions: &str,
    start: &str,
    expiry: &str,
    canonical_resource: &str,
    key: &UserDelegationKey,
    ip_range: &str,
    protocol: &str,
    version: &str,
    resource: &str,
) -> String {
    [
        permissions,
        start,
        expiry,
        canonical_resource,
        &key.signed_oid,
        &key.signed_tid,
        &key.signed_start,
        &key.signed_expiry,
        &key.signed_service,
        &key.signed_version,
        "", // signedAuthorizedUserObjectId
        "", // signedUnauthorizedUserObjectId
        "", // signedCorrelationId
        ip_range,
        protocol,
        version,
        resource,
        "", // signedSnapshotTime
        "", // signedEncryptionScope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n")
}

/// Second-precision UTC timestamps, the format the signature and the
/// query string both use.
fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn test_key() -> UserDelegationKey {
        UserDelegationKey {
            signed_oid: "a1b2c3d4-0000-1111-2222-333344445555".to_string(),
            signed_tid: "99999999-8888-7777-6666-555544443333".to_string(),
            signed_start: "2026-08-30T10:00:00Z".to_string(),
            signed_expiry: "2026-08-30T11:00:00Z".to_string(),
            signed_service: "b".to_string(),
            signed_version: AZURE_API_VERSION.to_string(),
            value: BASE64_STANDARD.encode(b"0123456789abcdef0123456789abcdef"),
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
        (start, start + Duration::hours(SAS_VALIDITY_HOURS))
    }

    fn decode_pairs(token: &SasToken) -> HashMap<String, String> {
        url::form_urlencoded::parse(token.as_str().as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_string_to_sign_layout() {
        let key = test_key();
        let sts = string_to_sign(
            "r",
            "2026-08-30T10:00:00Z",
            "2026-08-31T10:00:00Z",
            "/blob/acct/maps",
            &key,
            DEFAULT_IP_RANGE,
            "https",
            AZURE_API_VERSION,
            "c",
        );

        let fields: Vec<&str> = sts.split('\n').collect();
        assert_eq!(fields.len(), 24);
        assert_eq!(fields[0], "r");
        assert_eq!(fields[3], "/blob/acct/maps");
        assert_eq!(fields[4], key.signed_oid);
        assert_eq!(fields[13], DEFAULT_IP_RANGE);
        assert_eq!(fields[14], "https");
        assert_eq!(fields[16], "c");
        // optional trailing fields stay empty
        assert!(fields[17..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn test_token_decodes_to_read_only_https_day_window() {
        let (start, expiry) = window();
        let token =
            sign_container_sas("acct", "maps", &test_key(), start, expiry, DEFAULT_IP_RANGE)
                .unwrap();
        let pairs = decode_pairs(&token);

        assert_eq!(pairs["sp"], "r");
        assert_eq!(pairs["spr"], "https");
        assert_eq!(pairs["sr"], "c");
        assert_eq!(pairs["sv"], AZURE_API_VERSION);
        assert_eq!(pairs["sip"], DEFAULT_IP_RANGE);
        assert!(!pairs["sig"].is_empty());

        let st = DateTime::parse_from_rfc3339(&pairs["st"]).unwrap();
        let se = DateTime::parse_from_rfc3339(&pairs["se"]).unwrap();
        assert!(se > st);
        assert_eq!(se - st, Duration::hours(24));
    }

    #[test]
    fn test_query_values_are_percent_encoded() {
        let (start, expiry) = window();
        let token =
            sign_container_sas("acct", "maps", &test_key(), start, expiry, DEFAULT_IP_RANGE)
                .unwrap();

        // timestamps carry colons, which must be encoded in the raw string
        assert!(token.as_str().contains("st=2026-08-30T10%3A00%3A00Z"));
        assert!(!token.as_str().contains(' '));
    }

    #[test]
    fn test_signature_is_deterministic_and_input_sensitive() {
        let (start, expiry) = window();
        let key = test_key();

        let a = sign_container_sas("acct", "maps", &key, start, expiry, DEFAULT_IP_RANGE).unwrap();
        let b = sign_container_sas("acct", "maps", &key, start, expiry, DEFAULT_IP_RANGE).unwrap();
        assert_eq!(a, b);

        let other =
            sign_container_sas("acct", "other", &key, start, expiry, DEFAULT_IP_RANGE).unwrap();
        assert_ne!(decode_pairs(&a)["sig"], decode_pairs(&other)["sig"]);
    }

    #[test]
    fn test_rejects_non_base64_delegation_key() {
        let (start, expiry) = window();
        let mut key = test_key();
        key.value = "not base64!!".to_string();

        let err = sign_container_sas("acct", "maps", &key, start, expiry, DEFAULT_IP_RANGE)
            .expect_err("invalid key material must fail");
        assert!(matches!(err, SasError::InvalidKey(_)));
    }

    #[test]
    fn test_delegation_key_xml_parses() {
        let xml = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
            <UserDelegationKey>\
              <SignedOid>a1b2c3d4-0000-1111-2222-333344445555</SignedOid>\
              <SignedTid>99999999-8888-7777-6666-555544443333</SignedTid>\
              <SignedStart>2026-08-30T10:00:00Z</SignedStart>\
              <SignedExpiry>2026-08-30T11:00:00Z</SignedExpiry>\
              <SignedService>b</SignedService>\
              <SignedVersion>2023-11-03</SignedVersion>\
              <Value>AAECAwQF</Value>\
            </UserDelegationKey>";

        let key: UserDelegationKey = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(key.signed_service, "b");
        assert_eq!(key.signed_version, "2023-11-03");
        assert_eq!(key.value, "AAECAwQF");
    }

    #[test]
    fn test_format_time_is_second_precision() {
        let t = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_time(t), "2026-01-02T03:04:05Z");
    }
}

//! Azure Blob Storage chunk sink.
//!
//! Implements [`ChunkSink`] against the Azure Blob REST API using
//! `reqwest`.  One sink is bound to one target blob; the upload stream
//! drives it with staged blocks, page writes, or append blocks.
//!
//! Operations used:
//!   `stage_chunk()`       -> Put Block (`comp=block`)
//!   `upload_page_range()` -> Put Page (`comp=page`, `x-ms-page-write: update`)
//!   `append_chunk()`      -> Append Block (`comp=appendblock`,
//!                            `x-ms-blob-condition-appendpos`)
//!   `commit_block_list()` -> Put Block List (`comp=blocklist`)
//!   `blob_length()`       -> Get Blob Properties (HEAD)
//!
//! Credentials are resolved via:
//!   - `AZURE_STORAGE_KEY` environment variable (Shared Key auth)
//!   - `AZURE_STORAGE_CONNECTION_STRING` environment variable
//!   - `AZURE_STORAGE_SAS_TOKEN` environment variable (SAS token auth)

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::StatusCode;
use sha2::Sha256;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

use super::ChunkSink;
use crate::conditions::{AccessConditions, BlobDescriptor, BlobHeaders, BlobMetadata};
use crate::config::AccountConfig;
use crate::errors::ServiceError;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Chunk sink bound to a single blob in an Azure container.
pub struct AzureChunkSink {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// The remote Azure container name.
    container: String,
    /// Azure storage account name.
    account: String,
    /// Full blob name (prefix already applied).
    blob_name: String,
    /// The base URL for the Azure Blob service endpoint.
    base_url: String,
    /// Authentication method.
    auth: AzureAuth,
}

/// Azure authentication method.
enum AzureAuth {
    /// Shared Key authentication using the storage account key.
    SharedKey { key_bytes: Vec<u8> },
    /// SAS token authentication (appended as query parameter).
    SasToken { token: String },
}

impl AzureChunkSink {
    /// Create a sink bound to `blob_name` under the configured account
    /// and container.  Credentials are resolved from the environment.
    pub fn new(config: &AccountConfig, blob_name: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let base_url = if config.endpoint_url.is_empty() {
            format!("https://{}.blob.core.windows.net", config.account)
        } else {
            config.endpoint_url.trim_end_matches('/').to_string()
        };

        let auth = Self::resolve_auth()?;
        let blob_name = format!("{}{}", config.prefix, blob_name);

        info!(
            "Azure chunk sink initialized: account={} container={} blob={}",
            config.account, config.container, blob_name
        );

        Ok(Self {
            client,
            container: config.container.clone(),
            account: config.account.clone(),
            blob_name,
            base_url,
            auth,
        })
    }

    /// Resolve Azure authentication from environment variables.
    fn resolve_auth() -> anyhow::Result<AzureAuth> {
        // 1. Try AZURE_STORAGE_KEY
        if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
            let key_bytes = BASE64_STANDARD.decode(&key).map_err(|e| {
                anyhow::anyhow!("Invalid AZURE_STORAGE_KEY (not valid base64): {}", e)
            })?;
            return Ok(AzureAuth::SharedKey { key_bytes });
        }

        // 2. Try AZURE_STORAGE_CONNECTION_STRING (extract AccountKey)
        if let Ok(conn_str) = std::env::var("AZURE_STORAGE_CONNECTION_STRING") {
            for part in conn_str.split(';') {
                if let Some(key_val) = part.strip_prefix("AccountKey=") {
                    let key_bytes = BASE64_STANDARD.decode(key_val).map_err(|e| {
                        anyhow::anyhow!("Invalid AccountKey in connection string: {}", e)
                    })?;
                    return Ok(AzureAuth::SharedKey { key_bytes });
                }
            }
        }

        // 3. Try AZURE_STORAGE_SAS_TOKEN
        if let Ok(sas) = std::env::var("AZURE_STORAGE_SAS_TOKEN") {
            let token = if sas.starts_with('?') {
                sas[1..].to_string()
            } else {
                sas
            };
            return Ok(AzureAuth::SasToken { token });
        }

        Err(anyhow::anyhow!(
            "No Azure credentials found. Set AZURE_STORAGE_KEY, \
             AZURE_STORAGE_CONNECTION_STRING, or AZURE_STORAGE_SAS_TOKEN."
        ))
    }

    /// Compute the base64 Content-MD5 header value for a chunk body.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Build the full URL for the bound blob.
    fn blob_url(&self) -> String {
        let encoded_blob = percent_encoding::utf8_percent_encode(
            &self.blob_name,
            // Encode everything except unreserved + '/' (Azure expects '/' unencoded in blob paths).
            &AZURE_BLOB_ENCODE_SET,
        )
        .to_string();
        format!("{}/{}/{}", self.base_url, self.container, encoded_blob)
    }

    /// Sign a request using Azure Shared Key authentication and return
    /// the Authorization header value.
    ///
    /// Implements the Shared Key authorization scheme:
    /// `Authorization: SharedKey {account}:{signature}`
    ///
    /// The string-to-sign format:
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn sign_request(
        &self,
        method: &str,
        content_length: Option<usize>,
        content_md5: &str,
        content_type: &str,
        date: &str,
        if_match: &str,
        extra_headers: &[(String, String)],
        query_params: &[(String, String)],
    ) -> Result<String, ServiceError> {
        let key_bytes = match &self.auth {
            AzureAuth::SharedKey { key_bytes } => key_bytes,
            AzureAuth::SasToken { .. } => {
                return Err(ServiceError::transport(
                    method,
                    "cannot sign with SAS token auth",
                ));
            }
        };

        // Content-Length: empty for 0 or if not provided (HEAD).
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        // Build canonicalized headers (x-ms-* headers, sorted).
        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.clone()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        // Build canonicalized resource.
        // Azure Shared Key auth uses the un-encoded blob name in the
        // canonicalized resource (not the percent-encoded URL form).
        let mut canonicalized_resource =
            format!("/{}/{}/{}", self.account, self.container, self.blob_name);
        // Append query parameters sorted by key.
        if !query_params.is_empty() {
            let mut sorted_params = query_params.to_vec();
            sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted_params {
                canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
            }
        }

        // Date slot stays empty: x-ms-date is carried in the
        // canonicalized headers instead.
        let string_to_sign = format!(
            "{}\n\n\n{}\n{}\n{}\n\n\n{}\n\n\n\n{}\n{}",
            method,
            content_length_str,
            content_md5,
            content_type,
            if_match,
            canonicalized_headers,
            canonicalized_resource
        );

        // HMAC-SHA256 sign.
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key_bytes)
            .map_err(|e| ServiceError::transport(method, format!("HMAC key error: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        use std::time::SystemTime;
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Append SAS token to a URL if using SAS auth.
    fn maybe_append_sas(&self, url: &str) -> String {
        match &self.auth {
            AzureAuth::SasToken { token } => {
                if url.contains('?') {
                    format!("{}&{}", url, token)
                } else {
                    format!("{}?{}", url, token)
                }
            }
            AzureAuth::SharedKey { .. } => url.to_string(),
        }
    }

    /// Headers contributed by access conditions:
    /// `x-ms-lease-id` and `If-Match`.
    fn condition_headers(conditions: &AccessConditions) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(lease) = &conditions.lease_id {
            headers.push(("x-ms-lease-id".to_string(), lease.clone()));
        }
        if let Some(etag) = &conditions.if_match {
            headers.push(("If-Match".to_string(), etag.clone()));
        }
        headers
    }

    /// Build the XML body for Put Block List.
    fn block_list_xml(block_ids: &[String]) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n");
        for id in block_ids {
            xml.push_str(&format!("  <Latest>{}</Latest>\n", id));
        }
        xml.push_str("</BlockList>");
        xml
    }

    /// Issue a signed PUT with a body against the bound blob.
    ///
    /// `operation` names the call for error reporting; `query_params`
    /// must mirror the query string appended to `url`.
    #[allow(clippy::too_many_arguments)]
    async fn signed_put(
        &self,
        operation: &'static str,
        url: &str,
        query_params: &[(String, String)],
        content_type: &str,
        content_md5: Option<String>,
        extra_headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ServiceError> {
        let date = Self::rfc1123_date();
        let body_len = body.len();

        let mut req = self
            .client
            .put(self.maybe_append_sas(url))
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("Content-Type", content_type)
            .body(body);

        let md5_value = content_md5.unwrap_or_default();
        if !md5_value.is_empty() {
            req = req.header("Content-MD5", &md5_value);
        }

        let mut if_match = String::new();
        for (k, v) in &extra_headers {
            if k.eq_ignore_ascii_case("If-Match") {
                if_match = v.clone();
            }
            req = req.header(k, v);
        }

        if let AzureAuth::SharedKey { .. } = &self.auth {
            let auth_header = self.sign_request(
                "PUT",
                Some(body_len),
                &md5_value,
                content_type,
                &date,
                &if_match,
                &extra_headers,
                query_params,
            )?;
            req = req.header("Authorization", auth_header);
        }

        let resp = req.send().await.map_err(|e| {
            ServiceError::transport(operation, format!("request failed: {}", e))
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::http(operation, status, body));
        }

        Ok(resp)
    }
}

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

impl ChunkSink for AzureChunkSink {
    fn stage_chunk(
        &self,
        block_id: &str,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let block_id = block_id.to_string();
        let conditions = conditions.clone();
        Box::pin(async move {
            let url = format!("{}?comp=block&blockid={}", self.blob_url(), block_id);
            let query_params = vec![
                ("blockid".to_string(), block_id.clone()),
                ("comp".to_string(), "block".to_string()),
            ];

            debug!(
                "Azure put_block: blob={} block_id={} len={}",
                self.blob_name,
                block_id,
                data.len()
            );

            // Put Block only honours the lease condition; If-Match
            // applies at commit time.
            let mut headers = Vec::new();
            if let Some(lease) = &conditions.lease_id {
                headers.push(("x-ms-lease-id".to_string(), lease.clone()));
            }

            let md5 = Self::content_md5(&data);
            self.signed_put(
                "put_block",
                &url,
                &query_params,
                "application/octet-stream",
                Some(md5),
                headers,
                data.to_vec(),
            )
            .await?;

            Ok(())
        })
    }

    fn upload_page_range(
        &self,
        start: u64,
        end: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let conditions = conditions.clone();
        Box::pin(async move {
            let url = format!("{}?comp=page", self.blob_url());
            let query_params = vec![("comp".to_string(), "page".to_string())];

            debug!(
                "Azure put_page: blob={} range={}-{} len={}",
                self.blob_name,
                start,
                end,
                data.len()
            );

            let mut headers = Self::condition_headers(&conditions);
            headers.push(("x-ms-range".to_string(), format!("bytes={}-{}", start, end)));
            headers.push(("x-ms-page-write".to_string(), "update".to_string()));

            let md5 = Self::content_md5(&data);
            self.signed_put(
                "put_page",
                &url,
                &query_params,
                "application/octet-stream",
                Some(md5),
                headers,
                data.to_vec(),
            )
            .await?;

            Ok(())
        })
    }

    fn append_chunk(
        &self,
        expected_offset: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let conditions = conditions.clone();
        Box::pin(async move {
            let url = format!("{}?comp=appendblock", self.blob_url());
            let query_params = vec![("comp".to_string(), "appendblock".to_string())];

            debug!(
                "Azure append_block: blob={} offset={} len={}",
                self.blob_name,
                expected_offset,
                data.len()
            );

            let mut headers = Self::condition_headers(&conditions);
            // The service rejects with 412 if the blob length no longer
            // matches the expected append position.
            headers.push((
                "x-ms-blob-condition-appendpos".to_string(),
                expected_offset.to_string(),
            ));

            let md5 = Self::content_md5(&data);
            self.signed_put(
                "append_block",
                &url,
                &query_params,
                "application/octet-stream",
                Some(md5),
                headers,
                data.to_vec(),
            )
            .await?;

            Ok(())
        })
    }

    fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHeaders,
        metadata: &BlobMetadata,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDescriptor, ServiceError>> + Send + '_>> {
        let block_ids = block_ids.to_vec();
        let blob_headers = headers.clone();
        let metadata = metadata.clone();
        let conditions = conditions.clone();
        Box::pin(async move {
            let url = format!("{}?comp=blocklist", self.blob_url());
            let query_params = vec![("comp".to_string(), "blocklist".to_string())];

            debug!(
                "Azure put_block_list: blob={} blocks={}",
                self.blob_name,
                block_ids.len()
            );

            let mut extra = Self::condition_headers(&conditions);
            if let Some(ct) = &blob_headers.content_type {
                extra.push(("x-ms-blob-content-type".to_string(), ct.clone()));
            }
            if let Some(ce) = &blob_headers.content_encoding {
                extra.push(("x-ms-blob-content-encoding".to_string(), ce.clone()));
            }
            if let Some(cl) = &blob_headers.content_language {
                extra.push(("x-ms-blob-content-language".to_string(), cl.clone()));
            }
            if let Some(cc) = &blob_headers.cache_control {
                extra.push(("x-ms-blob-cache-control".to_string(), cc.clone()));
            }
            for (k, v) in &metadata {
                extra.push((format!("x-ms-meta-{}", k), v.clone()));
            }

            let xml = Self::block_list_xml(&block_ids).into_bytes();
            let resp = self
                .signed_put(
                    "commit_block_list",
                    &url,
                    &query_params,
                    "application/xml",
                    None,
                    extra,
                    xml,
                )
                .await?;

            let header_str = |name: &str| {
                resp.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            };

            Ok(BlobDescriptor {
                etag: header_str("etag"),
                last_modified: header_str("last-modified"),
            })
        })
    }

    fn blob_length(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let url = self.blob_url();
            let date = Self::rfc1123_date();

            debug!("Azure get_properties: blob={}", self.blob_name);

            let mut req = self
                .client
                .head(self.maybe_append_sas(&url))
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION);

            if let AzureAuth::SharedKey { .. } = &self.auth {
                let auth_header =
                    self.sign_request("HEAD", None, "", "", &date, "", &[], &[])?;
                req = req.header("Authorization", auth_header);
            }

            let resp = req.send().await.map_err(|e| {
                ServiceError::transport("get_properties", format!("request failed: {}", e))
            })?;

            if !resp.status().is_success() {
                let status = resp.status();
                if status == StatusCode::NOT_FOUND {
                    return Err(ServiceError::http(
                        "get_properties",
                        status.as_u16(),
                        format!("blob not found: {}", self.blob_name),
                    ));
                }
                return Err(ServiceError::http("get_properties", status.as_u16(), ""));
            }

            let len = resp
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    ServiceError::transport("get_properties", "missing Content-Length header")
                })?;

            Ok(len)
        })
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_md5_is_base64() {
        // MD5("") = 1B2M2Y8AsgTpgAmY7PhCfg== in base64.
        assert_eq!(
            AzureChunkSink::content_md5(b""),
            "1B2M2Y8AsgTpgAmY7PhCfg=="
        );
    }

    #[test]
    fn test_block_list_xml_format() {
        let block_ids = vec![
            BASE64_STANDARD.encode(b"prefix000000"),
            BASE64_STANDARD.encode(b"prefix000001"),
        ];
        let xml = AzureChunkSink::block_list_xml(&block_ids);

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<BlockList>"));
        assert!(xml.ends_with("</BlockList>"));
        assert_eq!(xml.matches("<Latest>").count(), 2);
        // Order in the XML must follow input order.
        let first = xml.find(&block_ids[0]).unwrap();
        let second = xml.find(&block_ids[1]).unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_block_list_xml_empty() {
        let xml = AzureChunkSink::block_list_xml(&[]);
        assert!(xml.contains("<BlockList>"));
        assert_eq!(xml.matches("<Latest>").count(), 0);
    }

    #[test]
    fn test_blob_url_encoding() {
        // Verify that '/' is preserved but spaces are encoded.
        let name = "prefix/container/key with spaces.bin";
        let encoded =
            percent_encoding::utf8_percent_encode(name, &AZURE_BLOB_ENCODE_SET).to_string();
        assert!(encoded.contains('/'));
        assert!(encoded.contains("%20"));
        assert!(!encoded.contains(' '));
    }

    #[test]
    fn test_blob_url_simple_name() {
        let name = "simple-blob";
        let encoded =
            percent_encoding::utf8_percent_encode(name, &AZURE_BLOB_ENCODE_SET).to_string();
        assert_eq!(encoded, "simple-blob");
    }

    #[test]
    fn test_rfc1123_date_format() {
        let date = AzureChunkSink::rfc1123_date();
        // RFC 1123 dates look like: "Mon, 24 Feb 2026 12:34:56 GMT"
        assert!(date.ends_with("GMT"));
        assert!(date.contains(','));
    }

    #[test]
    fn test_condition_headers_empty() {
        let headers = AzureChunkSink::condition_headers(&AccessConditions::none());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_condition_headers_full() {
        let conditions = AccessConditions {
            lease_id: Some("lease-1".to_string()),
            if_match: Some("\"0xETAG\"".to_string()),
        };
        let headers = AzureChunkSink::condition_headers(&conditions);
        assert_eq!(headers.len(), 2);
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-ms-lease-id" && v == "lease-1"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "If-Match" && v == "\"0xETAG\""));
    }

    #[test]
    fn test_sas_token_prefix_stripped() {
        // SAS tokens with leading '?' should have it stripped.
        let sas = "?sv=2023-11-03&ss=b&sig=xxx";
        let token = if sas.starts_with('?') {
            sas[1..].to_string()
        } else {
            sas.to_string()
        };
        assert!(!token.starts_with('?'));
        assert!(token.starts_with("sv="));
    }

    #[test]
    fn test_azure_api_version() {
        assert_eq!(AZURE_API_VERSION, "2023-11-03");
    }
}

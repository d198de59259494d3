//! S3-compatible object storage backend
//!
//! Requests are signed with AWS Signature Version 4 using `hmac` + `sha2`.
//! Artifacts larger than one part are written with a multipart upload so
//! only one part is buffered at a time.
//!
//! With a custom `endpoint` (MinIO, LocalStack, ...) path-style addressing is
//! used: `<endpoint>/<bucket>/<key>`. Without one, requests go to
//! `https://<bucket>.s3.<region>.amazonaws.com/<key>`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::StreamReader;

use super::{ArtifactSink, ByteReader, Storage};
use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};
use crate::types::SessionId;

type HmacSha256 = Hmac<Sha256>;

/// Smallest part S3 accepts for all but the last part of a multipart upload
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Stores chunks and artifacts as objects in one bucket
#[derive(Clone)]
pub struct ObjectStorage {
    client: Arc<ObjectClient>,
}

struct ObjectClient {
    http: reqwest::Client,
    config: ObjectStoreConfig,
    /// `scheme://host[:port]`
    origin: String,
    /// Value of the signed `host` header
    host: String,
    path_style: bool,
}

impl ObjectStorage {
    /// Create a backend for the configured bucket
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let (origin, host, path_style) = match &config.endpoint {
            Some(endpoint) => {
                let url = url::Url::parse(endpoint).map_err(|e| Error::Config {
                    message: format!("invalid object storage endpoint {endpoint:?}: {e}"),
                    key: Some("storage.object.endpoint".to_string()),
                })?;
                let host = match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.to_string(),
                    (None, _) => {
                        return Err(Error::Config {
                            message: format!("object storage endpoint {endpoint:?} has no host"),
                            key: Some("storage.object.endpoint".to_string()),
                        });
                    }
                };
                (format!("{}://{}", url.scheme(), host), host, true)
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
                (format!("https://{host}"), host, false)
            }
        };

        Ok(Self {
            client: Arc::new(ObjectClient {
                http: reqwest::Client::new(),
                config,
                origin,
                host,
                path_style,
            }),
        })
    }

    fn chunk_key(&self, session: &SessionId, index: u32) -> String {
        format!(
            "{}{}/chunk-{index}",
            self.client.config.staging_prefix, session
        )
    }

    fn artifact_key(&self, name: &str) -> String {
        format!("{}{name}", self.client.config.artifact_prefix)
    }
}

impl ObjectClient {
    fn canonical_uri(&self, key: &str) -> String {
        let encoded = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if self.path_style {
            format!("/{}/{}", uri_encode(&self.config.bucket), encoded)
        } else {
            format!("/{encoded}")
        }
    }

    /// Build a SigV4-signed request for `key`
    fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        body: Bytes,
    ) -> Result<reqwest::RequestBuilder> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut sorted_query = query.to_vec();
        sorted_query.sort();
        let canonical_query = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_uri = self.canonical_uri(key);
        let payload_hash = hex_sha256(&body);

        // Already in sorted order
        let headers = [
            ("host", self.host.as_str()),
            ("x-amz-content-sha256", payload_hash.as_str()),
            ("x-amz-date", amz_date.as_str()),
        ];
        let signed_headers = headers.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let region = &self.config.region;
        let credential_scope = format!("{date_stamp}/{region}/s3/aws4_request");
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.config.secret_access_key, &date_stamp, region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}{}", self.origin, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        Ok(self
            .http
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date)
            .body(body))
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let operation = method.clone();
        // Absence is an answer for reads and deletes, an error for writes
        let tolerate_missing = [Method::GET, Method::HEAD, Method::DELETE].contains(&operation);
        let response = self.request(method, key, query, body)?.send().await?;
        if response.status().is_success()
            || (tolerate_missing && response.status() == StatusCode::NOT_FOUND)
        {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Storage(format!(
            "{operation} {key} failed with HTTP {status}: {}",
            body.chars().take(300).collect::<String>()
        )))
    }

    /// GET an object as a stream, `None` on 404
    async fn get(&self, key: &str) -> Result<Option<(ByteReader, Option<u64>)>> {
        let response = self.send(Method::GET, key, &[], Bytes::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let len = response.content_length();
        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        Ok(Some((Box::new(StreamReader::new(stream)), len)))
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    fn backend_name(&self) -> &'static str {
        "object"
    }

    async fn put_chunk(&self, session: &SessionId, index: u32, data: Bytes) -> Result<()> {
        let key = self.chunk_key(session, index);
        self.client.send(Method::PUT, &key, &[], data).await?;
        tracing::debug!(session_id = %session, chunk_index = index, key = %key, "chunk staged");
        Ok(())
    }

    async fn open_chunk(&self, session: &SessionId, index: u32) -> Result<Option<ByteReader>> {
        let object = self.client.get(&self.chunk_key(session, index)).await?;
        Ok(object.map(|(reader, _)| reader))
    }

    async fn chunk_exists(&self, session: &SessionId, index: u32) -> Result<bool> {
        let response = self
            .client
            .send(Method::HEAD, &self.chunk_key(session, index), &[], Bytes::new())
            .await?;
        Ok(response.status() != StatusCode::NOT_FOUND)
    }

    async fn delete_session(&self, session: &SessionId, total_chunks: u32) -> Result<()> {
        for index in 0..total_chunks {
            self.client
                .send(Method::DELETE, &self.chunk_key(session, index), &[], Bytes::new())
                .await?;
        }
        Ok(())
    }

    async fn create_artifact(&self, name: &str) -> Result<Box<dyn ArtifactSink>> {
        Ok(Box::new(MultipartSink {
            client: Arc::clone(&self.client),
            key: self.artifact_key(name),
            upload_id: None,
            buffer: BytesMut::new(),
            parts: Vec::new(),
            written: 0,
            settled: false,
        }))
    }

    async fn open_artifact(&self, name: &str) -> Result<Option<(ByteReader, u64)>> {
        let key = self.artifact_key(name);
        match self.client.get(&key).await? {
            None => Ok(None),
            Some((reader, Some(len))) => Ok(Some((reader, len))),
            Some((_, None)) => Err(Error::Storage(format!(
                "GET {key} returned no content length"
            ))),
        }
    }

    async fn sweep_staging(&self, _older_than: Duration) -> Result<usize> {
        Err(Error::NotSupported(
            "object storage expires staged chunks through bucket lifecycle rules".to_string(),
        ))
    }
}

/// Artifact writer that switches to a multipart upload once a part fills up
struct MultipartSink {
    client: Arc<ObjectClient>,
    key: String,
    upload_id: Option<String>,
    buffer: BytesMut,
    /// `(part number, ETag)` in upload order
    parts: Vec<(u32, String)>,
    written: u64,
    /// Set once committed or aborted; an unsettled drop aborts the upload
    settled: bool,
}

impl MultipartSink {
    async fn upload_id(&mut self) -> Result<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let response = self
            .client
            .send(Method::POST, &self.key, &[("uploads", "")], Bytes::new())
            .await?;
        let body = response.text().await?;
        let id = extract_xml_value(&body, "UploadId").ok_or_else(|| {
            Error::Storage(format!("no UploadId in multipart initiation for {}", self.key))
        })?;
        tracing::debug!(key = %self.key, upload_id = %id, "multipart upload started");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn flush_part(&mut self) -> Result<()> {
        let upload_id = self.upload_id().await?;
        let part_number = self.parts.len() as u32 + 1;
        let part = self.buffer.split().freeze();

        let part_str = part_number.to_string();
        let response = self
            .client
            .send(
                Method::PUT,
                &self.key,
                &[("partNumber", part_str.as_str()), ("uploadId", upload_id.as_str())],
                part,
            )
            .await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Storage(format!("part {part_number} of {} has no ETag", self.key)))?;
        self.parts.push((part_number, etag));
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        if !self.buffer.is_empty() || self.parts.is_empty() {
            self.flush_part().await?;
        }
        let upload_id = self.upload_id().await?;

        let mut manifest = String::from("<CompleteMultipartUpload>");
        for (number, etag) in &self.parts {
            manifest.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{etag}</ETag></Part>"
            ));
        }
        manifest.push_str("</CompleteMultipartUpload>");

        let response = self
            .client
            .send(
                Method::POST,
                &self.key,
                &[("uploadId", upload_id.as_str())],
                Bytes::from(manifest),
            )
            .await?;
        // S3 can report a failed completion inside a 200 reply
        let body = response.text().await?;
        if body.contains("<Error>") {
            return Err(Error::Storage(format!(
                "completing {} failed: {}",
                self.key,
                extract_xml_value(&body, "Message").unwrap_or(body)
            )));
        }
        Ok(())
    }

    async fn abort_upload(&mut self) {
        self.settled = true;
        if let Some(upload_id) = self.upload_id.take() {
            abort_multipart(&self.client, &self.key, &upload_id).await;
        }
    }
}

async fn abort_multipart(client: &ObjectClient, key: &str, upload_id: &str) {
    if let Err(e) = client
        .send(Method::DELETE, key, &[("uploadId", upload_id)], Bytes::new())
        .await
    {
        tracing::warn!(key = %key, error = %e, "failed to abort multipart upload");
    }
}

impl Drop for MultipartSink {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        // Dropped mid-write, typically a cancelled merge
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let client = Arc::clone(&self.client);
                let key = std::mem::take(&mut self.key);
                runtime.spawn(async move { abort_multipart(&client, &key, &upload_id).await });
            }
            Err(_) => {
                tracing::warn!(key = %self.key, %upload_id, "multipart upload left open, no runtime to abort it");
            }
        }
    }
}

#[async_trait]
impl ArtifactSink for MultipartSink {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.written += data.len() as u64;
        self.buffer.extend_from_slice(&data);
        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        if self.upload_id.is_none() {
            self.settled = true;
            let body = self.buffer.split().freeze();
            self.client.send(Method::PUT, &self.key, &[], body).await?;
            return Ok(self.written);
        }
        if let Err(e) = self.complete().await {
            self.abort_upload().await;
            return Err(e);
        }
        self.settled = true;
        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) {
        self.abort_upload().await;
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Storage(format!("cannot initialise request signer: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the SigV4 signing key for a date, region and service
fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding, leaving only `A-Z a-z 0-9 - _ . ~` untouched
fn uri_encode(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::read_all;
    use wiremock::matchers::{body_bytes, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage_for(server: &MockServer) -> ObjectStorage {
        ObjectStorage::new(ObjectStoreConfig {
            endpoint: Some(server.uri()),
            bucket: "media".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        // Example from the AWS SigV4 documentation
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encoding_is_strict() {
        assert_eq!(uri_encode("a b/c~"), "a%20b%2Fc~");
        assert_eq!(uri_encode("chunk-0"), "chunk-0");
    }

    #[test]
    fn default_endpoint_is_virtual_hosted() {
        let storage = ObjectStorage::new(ObjectStoreConfig {
            bucket: "media".into(),
            region: "eu-west-1".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(storage.client.origin, "https://media.s3.eu-west-1.amazonaws.com");
        assert_eq!(storage.client.canonical_uri("uploads/x.mp4"), "/uploads/x.mp4");
    }

    #[tokio::test]
    async fn put_chunk_sends_signed_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/staging/s1/chunk-2"))
            .and(header_exists("authorization"))
            .and(header("x-amz-content-sha256", hex_sha256(b"abc").as_str()))
            .and(body_bytes(b"abc".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let session = SessionId::parse("s1").unwrap();
        storage
            .put_chunk(&session, 2, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[tokio::test]
    async fn missing_objects_map_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let session = SessionId::parse("s1").unwrap();
        assert!(storage.open_chunk(&session, 0).await.unwrap().is_none());
        assert!(!storage.chunk_exists(&session, 0).await.unwrap());
        assert!(storage.open_artifact("nope.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_chunk_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/staging/s1/chunk-0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"chunk bytes".to_vec()))
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let reader = storage
            .open_chunk(&SessionId::parse("s1").unwrap(), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_all(reader).await, b"chunk bytes");
    }

    #[tokio::test]
    async fn small_artifact_is_a_single_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/uploads/a-photo.png"))
            .and(body_bytes(b"tiny".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let written = storage
            .put_artifact("a-photo.png", Bytes::from_static(b"tiny"))
            .await
            .unwrap();
        assert_eq!(written, 4);
    }

    #[tokio::test]
    async fn large_artifact_uses_multipart_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/media/uploads/big.mp4"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/media/uploads/big.mp4"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag\""))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/media/uploads/big.mp4"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<CompleteMultipartUploadResult/>"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let mut sink = storage.create_artifact("big.mp4").await.unwrap();
        sink.write(Bytes::from(vec![7u8; MIN_PART_SIZE + 1])).await.unwrap();
        sink.write(Bytes::from_static(b"tail")).await.unwrap();
        assert_eq!(sink.commit().await.unwrap(), MIN_PART_SIZE as u64 + 5);

        let requests = server.received_requests().await.unwrap();
        let manifest = String::from_utf8(requests.last().unwrap().body.clone()).unwrap();
        assert!(manifest.contains("<PartNumber>1</PartNumber>"));
        assert!(manifest.contains("<PartNumber>2</PartNumber>"));
    }

    #[tokio::test]
    async fn dropped_sink_aborts_its_multipart_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/media/uploads/cut.mp4"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><UploadId>up-9</UploadId></InitiateMultipartUploadResult>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/media/uploads/cut.mp4"))
            .and(query_param("uploadId", "up-9"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag\""))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/media/uploads/cut.mp4"))
            .and(query_param("uploadId", "up-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let mut sink = storage.create_artifact("cut.mp4").await.unwrap();
        sink.write(Bytes::from(vec![1u8; MIN_PART_SIZE])).await.unwrap();
        drop(sink);

        // The abort runs on a spawned task
        let aborted = async {
            loop {
                let requests = server.received_requests().await.unwrap();
                if requests.iter().any(|r| r.method.as_str() == "DELETE") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), aborted).await.unwrap();
    }

    #[tokio::test]
    async fn committed_sink_does_not_abort() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/uploads/small.png"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let storage = storage_for(&server);
        let mut sink = storage.create_artifact("small.png").await.unwrap();
        sink.write(Bytes::from_static(b"png")).await.unwrap();
        sink.commit().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn sweeping_is_not_supported() {
        let server = MockServer::start().await;
        let err = storage_for(&server)
            .sweep_staging(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}

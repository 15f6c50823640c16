//! S3-compatible HTTP client.
//!
//! Uses path-style addressing (`{endpoint}/{bucket}/{key}`) so it works
//! against AWS as well as MinIO-style local endpoints, and signs every
//! request with SigV4.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::config::S3Config;
use crate::error::{StoreError, StoreResult};
use crate::object::{ListPage, ObjectClient};
use crate::sigv4::{self, SignableRequest, Signer, AMZ_DATE_FORMAT};
use crate::traits::{Attributes, ObjectEntry};

/// Prefix for user metadata headers.
const META_PREFIX: &str = "x-amz-meta-";

/// S3 object store client over `reqwest`.
#[derive(Clone, Debug)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: String,
    host: String,
    signer: Signer,
    session_token: Option<String>,
}

struct S3Request<'a> {
    method: Method,
    bucket: &'a str,
    key: Option<&'a str>,
    query: Vec<(String, String)>,
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl<'a> S3Request<'a> {
    fn new(method: Method, bucket: &'a str, key: Option<&'a str>) -> Self {
        Self {
            method,
            bucket,
            key,
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }
}

impl S3Client {
    pub fn new(config: &S3Config) -> StoreResult<Self> {
        let url = Url::parse(&config.endpoint)
            .map_err(|e| StoreError::Config(format!("invalid s3 endpoint {}: {e}", config.endpoint)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StoreError::Config(format!(
                    "s3 endpoint has no host: {}",
                    config.endpoint
                )))
            }
        };
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            host,
            signer: Signer::new(
                &config.access_key_id,
                &config.secret_access_key,
                &config.region,
                "s3",
            ),
            session_token: config.session_token.clone(),
        })
    }

    async fn send(&self, request: S3Request<'_>) -> StoreResult<reqwest::Response> {
        let path = match request.key {
            Some(key) => format!("/{}/{key}", request.bucket),
            None => format!("/{}", request.bucket),
        };
        let query = sigv4::canonical_query(&request.query);
        let mut url = format!("{}{}", self.endpoint, sigv4::encode_path(&path));
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let now = Utc::now();
        let payload_hash = sigv4::sha256_hex(&request.body);
        let mut headers = request.headers;
        headers.insert("host".into(), self.host.clone());
        headers.insert("x-amz-date".into(), now.format(AMZ_DATE_FORMAT).to_string());
        headers.insert("x-amz-content-sha256".into(), payload_hash.clone());
        if let Some(token) = &self.session_token {
            headers.insert("x-amz-security-token".into(), token.clone());
        }

        let authorization = self.signer.authorization(
            &SignableRequest {
                method: request.method.as_str(),
                path: &path,
                query: &request.query,
                headers: &headers,
                payload_hash: &payload_hash,
            },
            now,
        )?;

        let mut builder = self.http.request(request.method.clone(), &url);
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }
        debug!(method = %request.method, url = %url, "s3 request");
        let response = builder
            .header("authorization", authorization)
            .body(request.body)
            .send()
            .await?;
        Ok(response)
    }
}

async fn http_error(response: reqwest::Response) -> StoreError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StoreError::Http { status, body }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        attrs: &Attributes,
    ) -> StoreResult<()> {
        let mut request = S3Request::new(Method::PUT, bucket, Some(key));
        request.headers.insert("content-type".into(), content_type.to_string());
        for (name, value) in attrs {
            request
                .headers
                .insert(format!("{META_PREFIX}{}", name.to_ascii_lowercase()), value.clone());
        }
        request.body = body;

        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<Bytes>> {
        let response = self
            .send(S3Request::new(Method::GET, bucket, Some(key)))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?)),
            _ => Err(http_error(response).await),
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let response = self
            .send(S3Request::new(Method::HEAD, bucket, Some(key)))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(http_error(response).await),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let response = self
            .send(S3Request::new(Method::DELETE, bucket, Some(key)))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(http_error(response).await),
        }
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StoreResult<()> {
        let mut request = S3Request::new(Method::PUT, dst_bucket, Some(dst_key));
        request.headers.insert(
            "x-amz-copy-source".into(),
            sigv4::encode_path(&format!("/{src_bucket}/{src_key}")),
        );
        let response = self.send(request).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::not_found(src_bucket, src_key));
        }
        if !status.is_success() {
            return Err(http_error(response).await);
        }
        // A copy can fail after the 200 status line has been sent.
        let body = response.text().await?;
        if body.contains("<Error>") {
            return Err(StoreError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> StoreResult<ListPage> {
        let mut request = S3Request::new(Method::GET, bucket, None);
        request.query.push(("list-type".into(), "2".into()));
        request.query.push(("prefix".into(), prefix.to_string()));
        if let Some(token) = continuation {
            request
                .query
                .push(("continuation-token".into(), token.to_string()));
        }
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        let xml = response.text().await?;
        parse_list_objects(&xml)
    }
}

/// Parse a `ListObjectsV2` response body.
pub fn parse_list_objects(xml: &str) -> StoreResult<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut page = ListPage::default();
    let mut buf = Vec::new();
    let mut current_element = String::new();
    let mut in_contents = false;
    let mut truncated = false;
    let mut next_token: Option<String> = None;
    let mut entry = ObjectEntry {
        key: String::new(),
        size: 0,
        modified: None,
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current_element = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_element == "Contents" {
                    in_contents = true;
                    entry = ObjectEntry {
                        key: String::new(),
                        size: 0,
                        modified: None,
                    };
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| StoreError::Xml(err.to_string()))?
                    .to_string();
                match current_element.as_str() {
                    "Key" if in_contents => entry.key = text,
                    "Size" if in_contents => {
                        entry.size = text
                            .parse()
                            .map_err(|_| StoreError::Xml(format!("invalid Size: {text}")))?;
                    }
                    "LastModified" if in_contents => {
                        entry.modified = DateTime::parse_from_rfc3339(&text)
                            .ok()
                            .map(|ts| ts.with_timezone(&Utc));
                    }
                    "IsTruncated" => truncated = text == "true",
                    "NextContinuationToken" => next_token = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"Contents" {
                    in_contents = false;
                    page.entries.push(entry.clone());
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(StoreError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    page.next = if truncated { next_token } else { None };
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>eln</Name>
  <Prefix>submissions/S1/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>2</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents>
    <Key>submissions/S1/final-u1-a-20250101_000000-0011aabb.json</Key>
    <LastModified>2025-01-01T00:00:01.000Z</LastModified>
    <ETag>&quot;abc&quot;</ETag>
    <Size>512</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <Contents>
    <Key>submissions/S1/attachments/u1-f-0011aabb-a&amp;b.csv</Key>
    <LastModified>2025-01-01T00:00:02.000Z</LastModified>
    <Size>7</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn parses_entries_and_token() {
        let page = parse_list_objects(PAGE).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(
            page.entries[0].key,
            "submissions/S1/final-u1-a-20250101_000000-0011aabb.json"
        );
        assert_eq!(page.entries[0].size, 512);
        assert!(page.entries[0].modified.is_some());
        assert_eq!(
            page.entries[1].key,
            "submissions/S1/attachments/u1-f-0011aabb-a&b.csv"
        );
        assert_eq!(
            page.next.as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
    }

    #[test]
    fn untruncated_page_has_no_token() {
        let xml = r#"<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let page = parse_list_objects(xml).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn rejects_bad_size() {
        let xml = r#"<ListBucketResult><Contents><Key>k</Key><Size>big</Size></Contents></ListBucketResult>"#;
        assert!(matches!(parse_list_objects(xml), Err(StoreError::Xml(_))));
    }

    #[test]
    fn client_derives_host_with_port() {
        let client = S3Client::new(&S3Config {
            endpoint: "http://localhost:9000/".into(),
            region: "us-east-1".into(),
            access_key_id: "minio".into(),
            secret_access_key: "minio123".into(),
            session_token: None,
        })
        .unwrap();
        assert_eq!(client.host, "localhost:9000");
        assert_eq!(client.endpoint, "http://localhost:9000");
    }

    #[test]
    fn client_rejects_bad_endpoint() {
        let err = S3Client::new(&S3Config {
            endpoint: "not a url".into(),
            region: "us-east-1".into(),
            access_key_id: "a".into(),
            secret_access_key: "b".into(),
            session_token: None,
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}

// Object storage client. Speaks the vendor's signed REST protocol
// (header signatures, multipart uploads, presigned GET URLs) on top of the
// shared `HttpTransport`, authenticated with a short-lived STS credential.

use crate::error::{Error, ObjectStoreError, Result};
use crate::retry::Page;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

pub const SECURITY_TOKEN_HEADER: &str = "x-oss-security-token";

/// Sub-resources that take part in the signature. Other query parameters
/// (e.g. `part-number-marker`) are sent but not signed.
const SIGNED_SUBRESOURCES: &[&str] = &[
    "acl",
    "append",
    "delete",
    "location",
    "partNumber",
    "position",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "security-token",
    "uploadId",
    "uploads",
];

/// Short-lived STS credential issued by `config/stss`. Fetched fresh for
/// every upload, never cached.
#[derive(Clone, Deserialize)]
pub struct TemporaryCredential {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "AccessKeySecret")]
    pub access_key_secret: String,
    #[serde(rename = "SecurityToken")]
    pub security_token: String,
}

impl fmt::Debug for TemporaryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredential")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("security_token", &"<redacted>")
            .finish()
    }
}

/// A part that is known to be stored under a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// A bucket on the object store, bound to one credential.
pub struct Bucket {
    transport: Arc<dyn HttpTransport>,
    name: String,
    scheme: String,
    endpoint: String,
    credential: TemporaryCredential,
}

impl Bucket {
    /// `endpoint` is the region host (`oss-us-west-1.aliyuncs.com`),
    /// optionally with a scheme.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: &str,
        name: impl Into<String>,
        credential: TemporaryCredential,
    ) -> Self {
        let (scheme, host) = match endpoint.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host),
            None => ("https".to_string(), endpoint),
        };
        Self {
            transport,
            name: name.into(),
            scheme,
            endpoint: host.trim_end_matches('/').to_string(),
            credential,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}://{}.{}/{}",
            self.scheme,
            self.name,
            self.endpoint,
            encode_key(key)
        )
    }

    fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.credential.access_key_secret.as_bytes())
            .map_err(|e| Error::Configuration(format!("unusable access key secret: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn send(
        &self,
        method: Method,
        key: &str,
        query: Vec<(String, String)>,
        content_type: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let date = http_date(Utc::now());
        let mut headers = vec![
            ("Date".to_string(), date.clone()),
            (
                SECURITY_TOKEN_HEADER.to_string(),
                self.credential.security_token.clone(),
            ),
        ];
        if let Some(ct) = content_type {
            headers.push(("Content-Type".to_string(), ct.to_string()));
        }

        let to_sign = string_to_sign(
            method.as_str(),
            "",
            content_type.unwrap_or(""),
            &date,
            &headers,
            &canonical_resource(&self.name, key, &query),
        );
        let signature = self.sign(&to_sign)?;
        headers.push((
            "Authorization".to_string(),
            format!("OSS {}:{}", self.credential.access_key_id, signature),
        ));

        let request = HttpRequest {
            method: method.clone(),
            url: self.object_url(key),
            headers,
            query,
            body,
        };
        let res = self.transport.execute(request)?;
        if !res.is_success() {
            let err = parse_error(&res);
            debug!(%method, key, error = %err, "object store request failed");
            return Err(err.into());
        }
        Ok(res)
    }

    /// Upload a whole object in one request.
    pub fn put_object(&self, key: &str, data: &[u8]) -> Result<Option<String>> {
        let res = self.send(
            Method::PUT,
            key,
            Vec::new(),
            Some("application/octet-stream"),
            Some(data.to_vec()),
        )?;
        Ok(res.header("ETag").map(str::to_string))
    }

    /// Start a multipart upload and return its upload id.
    pub fn init_multipart_upload(&self, key: &str) -> Result<String> {
        let res = self.send(
            Method::POST,
            key,
            vec![("uploads".to_string(), String::new())],
            None,
            None,
        )?;
        xml_text(&res.text(), "UploadId")
            .ok_or_else(|| Error::protocol("InitiateMultipartUpload reply without UploadId"))
    }

    pub fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<String> {
        let res = self.send(
            Method::PUT,
            key,
            vec![
                ("partNumber".to_string(), part_number.to_string()),
                ("uploadId".to_string(), upload_id.to_string()),
            ],
            Some("application/octet-stream"),
            Some(data.to_vec()),
        )?;
        res.header("ETag")
            .map(str::to_string)
            .ok_or_else(|| Error::protocol(format!("UploadPart {} reply without ETag", part_number)))
    }

    /// One page of the parts already stored under `upload_id`, starting
    /// after part number `marker`.
    pub fn list_parts(&self, key: &str, upload_id: &str, marker: u64) -> Result<Page<PartInfo>> {
        let mut query = vec![("uploadId".to_string(), upload_id.to_string())];
        if marker > 0 {
            query.push(("part-number-marker".to_string(), marker.to_string()));
        }
        let res = self.send(Method::GET, key, query, None, None)?;
        parse_list_parts(&res.text(), marker)
    }

    pub fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<()> {
        let mut sorted: Vec<&PartInfo> = parts.iter().collect();
        sorted.sort_by_key(|p| p.part_number);

        let mut body = String::from("<CompleteMultipartUpload>");
        for part in sorted {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number,
                xml_escape(&part.etag)
            ));
        }
        body.push_str("</CompleteMultipartUpload>");

        self.send(
            Method::POST,
            key,
            vec![("uploadId".to_string(), upload_id.to_string())],
            Some("application/xml"),
            Some(body.into_bytes()),
        )?;
        Ok(())
    }

    /// Presigned download URL valid until `expires` (epoch seconds).
    pub fn presign_get(&self, key: &str, expires: i64) -> Result<String> {
        let params = vec![
            (
                "response-content-disposition".to_string(),
                "attachment".to_string(),
            ),
            (
                "security-token".to_string(),
                self.credential.security_token.clone(),
            ),
        ];
        let to_sign = format!(
            "GET\n\n\n{}\n{}",
            expires,
            canonical_resource(&self.name, key, &params)
        );
        let signature = self.sign(&to_sign)?;

        Ok(format!(
            "{}?OSSAccessKeyId={}&Expires={}&Signature={}&response-content-disposition=attachment&security-token={}",
            self.object_url(key),
            urlencoding::encode(&self.credential.access_key_id),
            expires,
            urlencoding::encode(&signature),
            urlencoding::encode(&self.credential.security_token)
        ))
    }
}

/// RFC 1123 date as the object store expects it in the `Date` header.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn string_to_sign(
    method: &str,
    content_md5: &str,
    content_type: &str,
    date: &str,
    headers: &[(String, String)],
    resource: &str,
) -> String {
    let mut oss_headers: Vec<(String, &str)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
        .filter(|(k, _)| k.starts_with("x-oss-"))
        .collect();
    oss_headers.sort();

    let canonical_headers: String = oss_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        method, content_md5, content_type, date, canonical_headers, resource
    )
}

fn canonical_resource(bucket: &str, key: &str, query: &[(String, String)]) -> String {
    let mut signed: Vec<&(String, String)> = query
        .iter()
        .filter(|(k, _)| SIGNED_SUBRESOURCES.contains(&k.as_str()))
        .collect();
    signed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut resource = format!("/{}/{}", bucket, key);
    if !signed.is_empty() {
        let params: Vec<String> = signed
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect();
        resource.push('?');
        resource.push_str(&params.join("&"));
    }
    resource
}

fn parse_error(res: &HttpResponse) -> ObjectStoreError {
    let body = res.text();
    ObjectStoreError {
        status: res.status,
        code: xml_text(&body, "Code").unwrap_or_else(|| "Unknown".to_string()),
        message: xml_text(&body, "Message").unwrap_or_else(|| body.trim().to_string()),
        request_id: xml_text(&body, "RequestId")
            .or_else(|| res.header("x-oss-request-id").map(str::to_string)),
    }
}

fn parse_list_parts(xml: &str, marker: u64) -> Result<Page<PartInfo>> {
    let mut items = Vec::new();
    for block in xml_elements(xml, "Part") {
        let part_number = xml_text(block, "PartNumber")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::protocol("ListParts entry without PartNumber"))?;
        let etag = xml_text(block, "ETag")
            .ok_or_else(|| Error::protocol("ListParts entry without ETag"))?;
        let size = xml_text(block, "Size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        items.push(PartInfo {
            part_number,
            etag,
            size,
        });
    }

    let is_truncated = xml_text(xml, "IsTruncated").is_some_and(|t| t.eq_ignore_ascii_case("true"));
    let next_marker = xml_text(xml, "NextPartNumberMarker")
        .and_then(|m| m.parse().ok())
        .or_else(|| items.iter().map(|p| p.part_number as u64).max())
        .unwrap_or(marker);

    Ok(Page {
        items,
        is_truncated,
        next_marker,
    })
}

/// Text of the first `<tag>` element.
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    xml_elements(xml, tag).first().map(|s| xml_unescape(s.trim()))
}

/// Inner text of every `<tag>...</tag>` element, in document order.
fn xml_elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                found.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    found
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// The `Boox` client: one authenticated session plus the operations the CLI
// exposes. `send_file` walks the upload-and-register flow:
//
//   Idle -> ListedBefore -> Credentialed -> Uploaded -> ListedAfter
//        -> Diffed -> RevisionAnnounced -> Registered
//
// A failure stops the walk where it happened. Nothing is rolled back: a
// failure after `Uploaded` leaves the object (and possibly a placeholder
// document) on the server, and `state()` tells which step was reached.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::listing::{self, FileListing, RemoteDocument};
use crate::oss::Bucket;
use crate::registration::{DocumentOptions, Registrar, StoredFile};
use crate::retry::ServerErrorPolicy;
use crate::session::{self, fetch_credential, Session};
use crate::transport::{ApiClient, HttpTransport, ReqwestTransport};
use crate::upload::{remote_key, UploadOptions, UploadedObject, Uploader};
use chrono::Utc;
use serde_json::json;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Steps of the send flow, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendState {
    Idle,
    ListedBefore,
    Credentialed,
    Uploaded,
    ListedAfter,
    Diffed,
    RevisionAnnounced,
    Registered,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendState::Idle => "idle",
            SendState::ListedBefore => "listed before upload",
            SendState::Credentialed => "credentialed",
            SendState::Uploaded => "uploaded",
            SendState::ListedAfter => "listed after upload",
            SendState::Diffed => "diffed",
            SendState::RevisionAnnounced => "revision announced",
            SendState::Registered => "registered",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful `send_file`.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub object: UploadedObject,
    pub document: RemoteDocument,
}

pub struct Boox {
    api: ApiClient,
    config: Config,
    session: Session,
    registrar: Registrar,
    state: SendState,
}

impl Boox {
    /// Open a session against `config.cloud` over HTTPS.
    pub fn connect(config: Config, code: Option<&str>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(
            config.request_timeout_secs,
        ))?);
        Self::with_transport(transport, config, code)
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        config: Config,
        code: Option<&str>,
    ) -> Result<Self> {
        let mut api = ApiClient::new(transport, config.cloud.clone());
        let session = Session::create(&mut api, &config, code)?;
        Ok(Self {
            api,
            config,
            session,
            registrar: Registrar::new(),
            state: SendState::Idle,
        })
    }

    /// Ask the service to mail a verification code to `email`.
    pub fn request_verification_code(config: &Config, email: &str) -> Result<()> {
        session::request_verification_code(&anonymous_api(config)?, email)
    }

    /// Exchange `email` and `code` for a bearer token.
    pub fn login(config: &Config, email: &str, code: &str) -> Result<String> {
        session::login(&anonymous_api(config)?, email, code)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Last step the send flow reached.
    pub fn state(&self) -> SendState {
        self.state
    }

    fn advance(&mut self, state: SendState) {
        info!(from = %self.state, to = %state, "send flow");
        self.state = state;
    }

    /// Upload `path` and register it as an already replicated document.
    /// `progress` receives (bytes sent, total bytes).
    pub fn send_file(
        &mut self,
        path: &Path,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<SendReport> {
        self.state = SendState::Idle;
        let options = DocumentOptions::from_config(&self.config)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| invalid_path(path, "has no usable file name"))?;
        let format = document_format(path).ok_or_else(|| invalid_path(path, "has no extension"))?;

        let before = self.list_files(self.config.page_size, 0)?;
        self.advance(SendState::ListedBefore);

        let credential = fetch_credential(&self.api)?;
        let bucket = Bucket::new(
            self.api.transport(),
            &self.session.object_endpoint,
            self.session.bucket_name.clone(),
            credential,
        );
        self.advance(SendState::Credentialed);

        let policy = ServerErrorPolicy::from_config(&self.config.upload);
        let uploader = Uploader::new(&bucket, &policy, UploadOptions::from(&self.config.upload));
        let key = uploader
            .pending_key(path, &self.session.push_prefix())
            .unwrap_or_else(|| remote_key(&self.session.user_id, path));
        let object = uploader.upload(path, &key, progress)?;
        self.save_and_push(&bucket, &object, &file_name, &format)?;
        self.advance(SendState::Uploaded);

        let after = self.list_files(self.config.page_size, 0)?;
        self.advance(SendState::ListedAfter);

        let document = listing::diff(&before, &after, &file_name)?;
        self.advance(SendState::Diffed);

        let announcement =
            self.registrar
                .announce(&self.api, &self.session.sync_session_id, &document)?;
        self.advance(SendState::RevisionAnnounced);

        let now = Utc::now();
        let expires = now.timestamp() + self.config.signed_url_expiry_secs as i64;
        let stored = StoredFile {
            file_name,
            file_size: object.size,
            user_id: self.session.user_id.clone(),
            format,
            bucket: bucket.name().to_string(),
            key: object.key.clone(),
            url: bucket.presign_get(&object.key, expires)?,
        };
        let document = self.registrar.commit(
            &self.api,
            &self.session.sync_session_id,
            announcement,
            &stored,
            &options,
            now.timestamp_millis(),
        )?;
        self.advance(SendState::Registered);

        Ok(SendReport { object, document })
    }

    /// Tell the service about the uploaded object; this creates the
    /// placeholder document.
    fn save_and_push(
        &self,
        bucket: &Bucket,
        object: &UploadedObject,
        file_name: &str,
        format: &str,
    ) -> Result<()> {
        self.api.post(
            "push/saveAndPush",
            &json!({
                "data": {
                    "bucket": bucket.name(),
                    "name": file_name,
                    "parent": null,
                    "resourceDisplayName": file_name,
                    "resourceKey": object.key,
                    "resourceType": format,
                    "title": file_name,
                }
            }),
        )?;
        Ok(())
    }

    /// One page of the remote listing.
    pub fn list_files(&self, limit: u32, offset: u32) -> Result<FileListing> {
        let reply = self.api.get_with_query(
            "push/message",
            &[("where", listing::listing_filter(limit, offset))],
        )?;
        FileListing::from_response(&reply)
    }

    /// Delete listing entries by id.
    pub fn delete_files(&self, ids: &[String]) -> Result<()> {
        self.api
            .post("push/message/batchDelete", &json!({ "ids": ids }))?;
        info!(count = ids.len(), "files deleted");
        Ok(())
    }
}

fn anonymous_api(config: &Config) -> Result<ApiClient> {
    let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
    Ok(ApiClient::new(Arc::new(transport), config.cloud.clone()))
}

/// Lowercase extension without the dot.
pub fn document_format(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(str::to_lowercase)
}

fn invalid_path(path: &Path, what: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} {}", path.display(), what),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::tests::raw_entry;
    use crate::listing::{render_table, TABLE_HEADER};
    use crate::testing::{
        json_response, oss_error, script_bootstrap, script_gateway, status_response, with_header,
        MockTransport,
    };
    use crate::transport::Method;
    use serde_json::Value;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;

    const OLD: &str = "1-cccccccccccccccccccccccccccccccc";

    fn config(dir: &TempDir) -> Config {
        let mut config = Config {
            token: Some("T".into()),
            device_mac: Some("aa:bb:cc:dd:ee:ff".into()),
            ..Config::default()
        };
        config.upload.retry_delay_ms = 0;
        config.upload.checkpoint_dir = dir.path().join("checkpoints");
        config
    }

    fn report_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("report.epub");
        std::fs::write(&path, vec![7u8; 1024]).unwrap();
        path
    }

    fn listing_reply(entries: &[Value]) -> crate::transport::HttpResponse {
        json_response(json!({ "list": entries }))
    }

    /// Every service a send talks to except the listing.
    fn script_services(mock: &MockTransport) {
        script_bootstrap(mock);
        mock.on(
            Method::GET,
            "/api/1/config/stss",
            json_response(json!({"data": {
                "AccessKeyId": "STS.id", "AccessKeySecret": "secret", "SecurityToken": "tok"
            }})),
        );
        mock.on(
            Method::PUT,
            "onyx-cloud-us.oss-us-west-1.aliyuncs.com",
            with_header(status_response(200, ""), "ETag", "\"E\""),
        );
        mock.on(
            Method::POST,
            "/api/1/push/saveAndPush",
            json_response(json!({"result_code": 0})),
        );
        script_gateway(mock);
    }

    /// Queue the listing before and after an upload of `report.epub`.
    fn script_listings(mock: &MockTransport) {
        let a = raw_entry("A", "a.epub", 1, "1-aa");
        let b = raw_entry("B", "b.pdf", 2, "1-bb");
        let c = raw_entry("C", "report.epub", 1024, OLD);
        mock.on(Method::GET, "/api/1/push/message", listing_reply(&[a.clone(), b.clone()]));
        mock.on(Method::GET, "/api/1/push/message", listing_reply(&[c, a, b]));
    }

    fn script_send(mock: &MockTransport) {
        script_services(mock);
        script_listings(mock);
    }

    #[test]
    fn sends_and_registers_a_file() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        script_send(&mock);

        let mut boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        let mut seen = Vec::new();
        let report = boox
            .send_file(&path, &mut |done, total| seen.push((done, total)))
            .unwrap();
        assert_eq!(boox.state(), SendState::Registered);
        assert_eq!(seen.last(), Some(&(1024, 1024)));

        // object key is <uid>/push/<uuid>.epub
        let key = &report.object.key;
        let uuid = key
            .strip_prefix("U/push/")
            .and_then(|k| k.strip_suffix(".epub"))
            .unwrap();
        assert!(Uuid::parse_str(uuid).is_ok());
        assert_eq!(report.object.size, 1024);
        let put = &mock.requests_to("aliyuncs.com")[0];
        assert!(put.url.ends_with(key.as_str()));
        assert_eq!(put.body.as_ref().map(Vec::len), Some(1024));

        let push = mock.requests_to("saveAndPush")[0].json_body().unwrap();
        assert_eq!(push["data"]["resourceKey"], json!(key));
        assert_eq!(push["data"]["resourceType"], "epub");
        assert_eq!(push["data"]["bucket"], "onyx-cloud-us");
        assert_eq!(push["data"]["parent"], Value::Null);

        let document = &report.document;
        assert_eq!(document.document_id, "C");
        assert_eq!(document.parent_revision.as_ref().unwrap().to_string(), OLD);
        assert_eq!(document.current_revision.generation(), 2);

        let revs_diff = mock.requests_to("_revs_diff");
        assert_eq!(revs_diff.len(), 1);
        assert_eq!(
            revs_diff[0].json_body().unwrap(),
            json!({"C": [document.current_revision.to_string()]})
        );

        let bulk = mock.requests_to("_bulk_docs");
        assert_eq!(bulk.len(), 1);
        let body = bulk[0].json_body().unwrap();
        assert_eq!(body["new_edits"], json!(false));
        let ids = body["docs"][0]["_revisions"]["ids"].as_array().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], json!("c".repeat(32)));

        let content: Value =
            serde_json::from_str(body["docs"][0]["content"].as_str().unwrap()).unwrap();
        let url = content["storage"]["epub"]["oss"]["url"].as_str().unwrap();
        assert!(url.starts_with(&format!(
            "https://onyx-cloud-us.oss-us-west-1.aliyuncs.com/{}?OSSAccessKeyId=STS.id&Expires=",
            key
        )));
        assert_eq!(content["mac"], "aa:bb:cc:dd:ee:ff");

        let listing = boox.list_files(24, 0).unwrap();
        let mut out = Vec::new();
        render_table(&listing, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(TABLE_HEADER));
        assert!(text.lines().any(|l| l == "C |       1024 | report.epub"));
    }

    #[test]
    fn unchanged_listing_stops_before_registration() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        script_services(&mock);
        let a = raw_entry("A", "a.epub", 1, "1-aa");
        let b = raw_entry("B", "b.pdf", 2, "1-bb");
        mock.on(Method::GET, "/api/1/push/message", listing_reply(&[a, b]));

        let mut boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        let err = boox.send_file(&path, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("report.epub"));
        assert_eq!(boox.state(), SendState::ListedAfter);
        assert_eq!(mock.requests_to("saveAndPush").len(), 1);
        assert!(mock.requests_to("/neocloud/").is_empty());
    }

    #[test]
    fn gateway_not_wanting_the_revision_fails_the_send() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        mock.on(Method::POST, "/neocloud/_revs_diff", json_response(json!({})));
        script_send(&mock);

        let mut boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        let err = boox.send_file(&path, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(boox.state(), SendState::Diffed);
        assert_eq!(mock.requests_to("_revs_diff").len(), 1);
        assert!(mock.requests_to("_bulk_docs").is_empty());
    }

    #[test]
    fn rejected_upload_is_not_retried_or_registered() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        mock.on(Method::PUT, "aliyuncs.com", oss_error(403, "AccessDenied"));
        script_send(&mock);

        let mut boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        let err = boox.send_file(&path, &mut |_, _| {}).unwrap_err();
        assert_eq!(err.transfer_status(), Some(403));
        assert_eq!(boox.state(), SendState::Credentialed);
        assert_eq!(mock.requests_to("aliyuncs.com").len(), 1);
        assert!(mock.requests_to("saveAndPush").is_empty());
    }

    #[test]
    fn missing_device_mac_fails_before_any_call() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        script_send(&mock);
        let config = Config {
            device_mac: None,
            ..config(&dir)
        };

        let mut boox = Boox::with_transport(mock.clone(), config, None).unwrap();
        let calls = mock.requests().len();
        let err = boox.send_file(&path, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(mock.requests().len(), calls);
        assert_eq!(boox.state(), SendState::Idle);
    }

    #[test]
    fn second_send_of_same_placeholder_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = report_file(&dir);
        let mock = MockTransport::new();
        script_send(&mock);
        // the second send sees the same before/after pair again
        script_listings(&mock);

        let mut boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        boox.send_file(&path, &mut |_, _| {}).unwrap();
        let err = boox.send_file(&path, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref id) if id == "C"));
        assert_eq!(boox.state(), SendState::Diffed);
        assert_eq!(mock.requests_to("_bulk_docs").len(), 1);
    }

    #[test]
    fn list_and_delete_use_push_message() {
        let dir = TempDir::new().unwrap();
        let mock = MockTransport::new();
        script_bootstrap(&mock);
        mock.on(
            Method::GET,
            "/api/1/push/message",
            listing_reply(&[raw_entry("A", "a.epub", 5, "1-aa")]),
        );
        mock.on(
            Method::POST,
            "/api/1/push/message/batchDelete",
            json_response(json!({"result_code": 0})),
        );

        let boox = Boox::with_transport(mock.clone(), config(&dir), None).unwrap();
        let listing = boox.list_files(10, 20).unwrap();
        assert_eq!(listing.len(), 1);
        let list_req = &mock.requests_to("push/message")[0];
        let filter: Value = serde_json::from_str(list_req.query_value("where").unwrap()).unwrap();
        assert_eq!(filter, json!({"limit": 10, "offset": 20, "parent": 0}));

        boox.delete_files(&["A".to_string(), "B".to_string()]).unwrap();
        let delete = &mock.requests_to("batchDelete")[0];
        assert_eq!(delete.json_body().unwrap(), json!({"ids": ["A", "B"]}));
    }

    #[test]
    fn format_comes_from_extension() {
        assert_eq!(document_format(Path::new("/x/Book.EPUB")).as_deref(), Some("epub"));
        assert_eq!(document_format(Path::new("notes.pdf")).as_deref(), Some("pdf"));
        assert_eq!(document_format(Path::new("README")), None);
    }

    #[test]
    fn states_are_ordered() {
        assert!(SendState::Idle < SendState::ListedBefore);
        assert!(SendState::RevisionAnnounced < SendState::Registered);
        assert_eq!(SendState::ListedAfter.to_string(), "listed after upload");
    }
}

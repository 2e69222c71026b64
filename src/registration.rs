// Revision forging against the document sync gateway.
//
// After an upload the server creates a placeholder document at generation
// 1. To make devices treat the file as already replicated, we mint
// generation 2 ourselves: announce it through `_revs_diff`, then write the
// full document through `_bulk_docs` with `new_edits = false` and a
// two-element `_revisions` chain, so the gateway stores it verbatim
// instead of running its own conflict handling.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::listing::RemoteDocument;
use crate::revision::RevisionId;
use crate::transport::ApiClient;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Device and payload options that end up inside the document body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentOptions {
    pub device_mac: String,
    pub device_model: String,
    pub distribute_channel: String,
    pub include_created_at: bool,
}

impl DocumentOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            device_mac: config.device_mac()?.to_string(),
            device_model: config.device_model.clone(),
            distribute_channel: config.distribute_channel.clone(),
            include_created_at: config.include_created_at,
        })
    }
}

/// What we know about the uploaded file when registering it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub file_name: String,
    pub file_size: u64,
    pub user_id: String,
    /// Lowercase extension without the dot, e.g. `epub`.
    pub format: String,
    pub bucket: String,
    pub key: String,
    /// Presigned download URL of the object.
    pub url: String,
}

/// A revision that has been announced but not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub document: RemoteDocument,
    pub new_revision: RevisionId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OssLocation<'a> {
    display_name: &'a str,
    expires: u64,
    key: &'a str,
    provider: &'static str,
    size: u64,
    bucket: &'a str,
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct StorageEntry<'a> {
    oss: OssLocation<'a>,
}

/// Inner `content` record. Serialized to a JSON string inside the document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentBody<'a> {
    category: Vec<String>,
    tags: Vec<String>,
    formats: Vec<&'a str>,
    view_count: u64,
    download_count: u64,
    comments_count: u64,
    size: u64,
    source_type: u64,
    child_count: u64,
    push_num: u64,
    is_folder: &'static str,
    parent: Option<String>,
    #[serde(rename = "_id")]
    id: &'a str,
    storage: BTreeMap<&'a str, StorageEntry<'a>>,
    user_id: &'a str,
    name: &'a str,
    owner_id: &'a str,
    title: &'a str,
    distribute_channel: &'a str,
    guid: &'a str,
    mac: &'a str,
    device_model: &'a str,
    updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<i64>,
}

#[derive(Debug, Serialize)]
struct Revisions {
    start: u64,
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkDocument<'a> {
    content_type: &'static str,
    content: String,
    msg_type: u32,
    db_id: String,
    user: &'a str,
    name: &'a str,
    size: u64,
    unique_id: &'a str,
    created_at: i64,
    updated_at: i64,
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_rev")]
    rev: String,
    #[serde(rename = "_revisions")]
    revisions: Revisions,
}

#[derive(Debug, Serialize)]
struct BulkDocsRequest<'a> {
    docs: Vec<BulkDocument<'a>>,
    new_edits: bool,
}

/// The `_revisions` chain for `new` on top of `previous`.
fn revision_chain(new: &RevisionId, previous: &RevisionId) -> Revisions {
    Revisions {
        start: new.generation(),
        ids: vec![new.digest().to_string(), previous.digest().to_string()],
    }
}

/// Build the `_bulk_docs` payload that writes `new_revision` for `document`.
/// `now_ms` is the update time in epoch milliseconds.
pub fn bulk_docs_payload(
    document: &RemoteDocument,
    new_revision: &RevisionId,
    file: &StoredFile,
    options: &DocumentOptions,
    now_ms: i64,
) -> Result<Value> {
    let mut storage = BTreeMap::new();
    storage.insert(
        file.format.as_str(),
        StorageEntry {
            oss: OssLocation {
                display_name: &file.file_name,
                expires: 0,
                key: &file.key,
                provider: "oss",
                size: file.file_size,
                bucket: &file.bucket,
                url: &file.url,
            },
        },
    );

    let content = ContentBody {
        category: Vec::new(),
        tags: Vec::new(),
        formats: vec![file.format.as_str()],
        view_count: 0,
        download_count: 0,
        comments_count: 0,
        size: file.file_size,
        source_type: 0,
        child_count: 0,
        push_num: 1,
        is_folder: "no",
        parent: None,
        id: &document.document_id,
        storage,
        user_id: &file.user_id,
        name: &file.file_name,
        owner_id: &file.user_id,
        title: &file.file_name,
        distribute_channel: &options.distribute_channel,
        guid: &document.document_id,
        mac: &options.device_mac,
        device_model: &options.device_model,
        updated_at: now_ms,
        created_at: options.include_created_at.then_some(now_ms),
    };

    let doc = BulkDocument {
        content_type: "digital_content",
        content: serde_json::to_string(&content)?,
        msg_type: 2,
        db_id: format!("{}-MESSAGE", file.user_id),
        user: &file.user_id,
        name: &file.file_name,
        size: file.file_size,
        unique_id: &document.document_id,
        created_at: now_ms,
        updated_at: now_ms,
        id: &document.document_id,
        rev: new_revision.to_string(),
        revisions: revision_chain(new_revision, &document.current_revision),
    };

    Ok(serde_json::to_value(BulkDocsRequest {
        docs: vec![doc],
        new_edits: false,
    })?)
}

/// Writes forged revisions. Remembers which documents it has already
/// touched and refuses to touch them again, since every call would mint a
/// new random revision on top of the same parent.
#[derive(Debug, Default)]
pub struct Registrar {
    registered: HashSet<String>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, document_id: &str) -> bool {
        self.registered.contains(document_id)
    }

    /// Mint the next revision and announce it through `_revs_diff`.
    pub fn announce(
        &mut self,
        api: &ApiClient,
        session_id: &str,
        document: &RemoteDocument,
    ) -> Result<Announcement> {
        if !self.registered.insert(document.document_id.clone()) {
            return Err(Error::AlreadyRegistered(document.document_id.clone()));
        }

        let new_revision = document.current_revision.next()?;
        let mut body = serde_json::Map::new();
        body.insert(
            document.document_id.clone(),
            Value::from(vec![new_revision.to_string()]),
        );
        let reply = api.gateway_post("_revs_diff", &Value::Object(body), session_id)?;
        ensure_revision_missing(&reply, &document.document_id, &new_revision)?;

        info!(document = %document.document_id, revision = %new_revision, "revision announced");
        Ok(Announcement {
            document: document.clone(),
            new_revision,
        })
    }

    /// Write the announced revision through `_bulk_docs`.
    pub fn commit(
        &mut self,
        api: &ApiClient,
        session_id: &str,
        announcement: Announcement,
        file: &StoredFile,
        options: &DocumentOptions,
        now_ms: i64,
    ) -> Result<RemoteDocument> {
        let Announcement {
            document,
            new_revision,
        } = announcement;

        let payload = bulk_docs_payload(&document, &new_revision, file, options, now_ms)?;
        let reply = api.gateway_post("_bulk_docs", &payload, session_id)?;
        check_bulk_reply(&reply)?;
        info!(document = %document.document_id, revision = %new_revision, "revision written");

        Ok(RemoteDocument {
            document_id: document.document_id,
            name: document.name,
            parent_revision: Some(document.current_revision),
            current_revision: new_revision,
        })
    }

    /// Announce and write in one go.
    pub fn register(
        &mut self,
        api: &ApiClient,
        session_id: &str,
        document: &RemoteDocument,
        file: &StoredFile,
        options: &DocumentOptions,
        now_ms: i64,
    ) -> Result<RemoteDocument> {
        let announcement = self.announce(api, session_id, document)?;
        self.commit(api, session_id, announcement, file, options, now_ms)
    }
}

/// Check a `_revs_diff` reply: `{docId: {"missing": [rev, ..]}}` must list
/// the freshly minted revision. Anything else means the gateway will not
/// take the bulk write.
fn ensure_revision_missing(reply: &Value, document_id: &str, revision: &RevisionId) -> Result<()> {
    let map = reply
        .as_object()
        .ok_or_else(|| Error::protocol(format!("_revs_diff replied with {}", reply)))?;
    if let Some(reason) = map.get("error") {
        return Err(Error::protocol(format!("_revs_diff failed: {}", reason)));
    }

    let entry = map.get(document_id).ok_or_else(|| {
        Error::protocol(format!("_revs_diff reply does not mention {}: {}", document_id, reply))
    })?;
    let missing = entry
        .get("missing")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::protocol(format!("_revs_diff entry without missing list: {}", entry)))?;
    let wanted = revision.to_string();
    if !missing.iter().any(|r| r.as_str() == Some(wanted.as_str())) {
        return Err(Error::protocol(format!(
            "_revs_diff does not list {} as missing for {}",
            wanted, document_id
        )));
    }
    Ok(())
}

/// A `_bulk_docs` reply is an array of per-document results.
fn check_bulk_reply(reply: &Value) -> Result<()> {
    let results = reply
        .as_array()
        .ok_or_else(|| Error::protocol(format!("_bulk_docs replied with {}", reply)))?;
    for result in results {
        if let Some(error) = result.get("error") {
            let reason = result.get("reason").cloned().unwrap_or(Value::Null);
            return Err(Error::protocol(format!(
                "_bulk_docs rejected {}: {} {}",
                result.get("id").cloned().unwrap_or(Value::Null),
                error,
                reason
            )));
        }
    }
    Ok(())
}

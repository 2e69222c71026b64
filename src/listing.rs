// Remote file listing: parsing the `push/message` reply, finding the
// entry a just-finished upload produced by diffing two snapshots, and
// rendering the listing as the CLI's fixed-width table.

use crate::error::{Error, Result};
use crate::revision::RevisionId;
use crate::session::string_at;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, Write};

/// One entry of the remote listing. Entries compare by their raw record.
#[derive(Debug, Clone)]
pub struct ListingEntry {
    /// Listing id, shown in the table and used for deletes.
    pub id: String,
    /// Id of the backing document in the sync gateway.
    pub document_id: String,
    /// Current revision of that document, when the server reports one.
    pub revision: Option<String>,
    pub name: String,
    /// Formats in the server's order; the first one is the primary.
    pub formats: Vec<String>,
    pub size_by_format: BTreeMap<String, u64>,
    pub raw: Value,
}

impl PartialEq for ListingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl ListingEntry {
    /// Parse one element of the listing's `list` array.
    pub fn from_raw(raw: Value) -> Result<Self> {
        let args = raw
            .pointer("/data/args")
            .ok_or_else(|| Error::protocol("listing entry without data.args"))?;

        let id = string_at(args, "/_id")
            .ok_or_else(|| Error::protocol("listing entry without _id"))?;
        let document_id = string_at(args, "/cbMsg/id").unwrap_or_else(|| id.clone());
        let revision = string_at(args, "/cbMsg/rev");
        let name = string_at(args, "/name").unwrap_or_default();

        let formats: Vec<String> = args
            .get("formats")
            .and_then(Value::as_array)
            .map(|f| f.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut size_by_format = BTreeMap::new();
        for format in &formats {
            let pointer = format!("/storage/{}/oss/size", format);
            if let Some(size) = string_at(args, &pointer).and_then(|s| s.parse().ok()) {
                size_by_format.insert(format.clone(), size);
            }
        }

        Ok(Self {
            id,
            document_id,
            revision,
            name,
            formats,
            size_by_format,
            raw,
        })
    }

    /// Size of the primary format, 0 when unknown.
    pub fn size(&self) -> u64 {
        self.formats
            .first()
            .and_then(|f| self.size_by_format.get(f))
            .copied()
            .unwrap_or(0)
    }
}

/// Snapshot of the remote listing, in server order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileListing {
    pub entries: Vec<ListingEntry>,
}

impl FileListing {
    /// Parse a `push/message` reply.
    pub fn from_response(reply: &Value) -> Result<Self> {
        let list = reply
            .get("list")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::protocol("push/message reply without a list"))?;
        let entries = list
            .iter()
            .cloned()
            .map(ListingEntry::from_raw)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListingEntry> {
        self.entries.iter()
    }

    fn contains(&self, entry: &ListingEntry) -> bool {
        self.entries.iter().any(|e| e == entry)
    }
}

/// The `where` filter of a listing call.
pub fn listing_filter(limit: u32, offset: u32) -> String {
    json!({"limit": limit, "offset": offset, "parent": 0}).to_string()
}

/// A document in the sync gateway together with its revision lineage.
///
/// Only the id, name and revisions are tracked here. The document body
/// written back to the gateway (`contentBody`) is built from the upload by
/// `registration::bulk_docs_payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub document_id: String,
    pub name: String,
    pub current_revision: RevisionId,
    /// `None` for a document found by [`diff`]; `Registrar::commit` sets it
    /// to the revision it replaced.
    pub parent_revision: Option<RevisionId>,
}

/// Entries of `after` that are not in `before`, in `after`'s order.
pub fn new_entries<'a>(before: &FileListing, after: &'a FileListing) -> Vec<&'a ListingEntry> {
    after.iter().filter(|e| !before.contains(e)).collect()
}

/// Find the document created by an upload: the first new entry whose name
/// contains `expected_name`.
pub fn diff(before: &FileListing, after: &FileListing, expected_name: &str) -> Result<RemoteDocument> {
    let entry = new_entries(before, after)
        .into_iter()
        .find(|e| e.name.contains(expected_name))
        .ok_or_else(|| Error::NotFound(format!("{}: file not found in new list", expected_name)))?;

    let revision = entry.revision.as_deref().ok_or_else(|| {
        Error::protocol(format!("new entry {} carries no document revision", entry.id))
    })?;

    Ok(RemoteDocument {
        document_id: entry.document_id.clone(),
        name: entry.name.clone(),
        current_revision: revision.parse()?,
        parent_revision: None,
    })
}

pub const TABLE_HEADER: &str = "        ID               |    Size    | Name";
pub const TABLE_RULE: &str =
    "-------------------------|------------|-------------------------------------------------------";

/// One table row: `<id> | <size> | <name>`.
pub fn table_row(entry: &ListingEntry) -> String {
    format!("{} | {:>10} | {}", entry.id, entry.size(), entry.name)
}

/// Write the whole listing as a table.
pub fn render_table(listing: &FileListing, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "{}", TABLE_HEADER)?;
    writeln!(out, "{}", TABLE_RULE)?;
    for entry in listing.iter() {
        writeln!(out, "{}", table_row(entry))?;
    }
    Ok(())
}

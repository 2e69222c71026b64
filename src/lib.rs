// Library root
// ------------
// send2boox uploads a local file to a Boox cloud account and registers it
// in the account's document store as if a device had already synced it.
// The binary (`main.rs`) is a thin CLI over these modules.
//
// Module responsibilities:
// - `transport`: HTTP abstraction and the JSON API client.
// - `session`: authentication and discovery of bucket and sync session.
// - `oss` and `upload`: signed object-store requests, multipart and
//   resumable uploads, with the retry helpers from `retry`.
// - `listing`: remote file listing, the before/after diff and the table.
// - `revision` and `registration`: forging the next document revision.
// - `client`: the `Boox` client tying the flow together.
// - `ui`: prompts, progress bars and printing for the CLI.
pub mod client;
pub mod config;
pub mod error;
pub mod listing;
pub mod oss;
pub mod registration;
pub mod retry;
pub mod revision;
pub mod session;
pub mod transport;
pub mod ui;
pub mod upload;

#[cfg(test)]
mod testing;

pub use client::{Boox, SendReport, SendState};
pub use config::Config;
pub use error::{Error, ObjectStoreError, Result};

//! Exchange ActiveSync client bindings for Rust.
//!
//! # Usage
//!
//! Here is a basic example of syncing a mailbox. The connection speaks the
//! binary WBXML dialect of the protocol over HTTP; every command is a POST
//! against the server's `Microsoft-Server-ActiveSync` endpoint.
//!
//! ```no_run
//! use eas_client::connection::ConnectionBuilder;
//! use eas_client::protocol::Lookback;
//! use eas_client::sync::email::{EmailSync, EmailSyncHandler, MessageData};
//! use eas_client::sync::folders::{folder_sync, FolderData, FolderSyncHandler};
//! use eas_client::sync::run_sync;
//!
//! struct Store; // your message and folder storage
//!
//! impl EmailSyncHandler for Store {
//!     fn add_message(&mut self, message: MessageData) { /* ... */ }
//!     fn remove_message(&mut self, server_id: &str) { /* ... */ }
//!     fn read_state_changed(&mut self, server_id: &str, read: bool) { /* ... */ }
//!     fn flag_state_changed(&mut self, server_id: &str, flagged: bool) { /* ... */ }
//!     fn message_replied_to(&mut self, server_id: &str) { /* ... */ }
//!     fn message_forwarded(&mut self, server_id: &str) { /* ... */ }
//!     fn commit_message_changes(&mut self) { /* ... */ }
//! }
//!
//! impl FolderSyncHandler for Store {
//!     fn add_folder(&mut self, folder: FolderData) { /* ... */ }
//!     fn remove_folder(&mut self, server_id: &str) { /* ... */ }
//!     fn change_folder(&mut self, folder: FolderData) { /* ... */ }
//!     fn clear_folders(&mut self) { /* ... */ }
//!     fn commit_folder_changes(&mut self) { /* ... */ }
//! }
//!
//! fn main() -> eas_client::error::Result<()> {
//!     let mut conn = ConnectionBuilder::new("mail.example.org", "user", "password")
//!         .user_agent("MyClient/1.0")
//!         .build();
//!
//!     let mut store = Store;
//!     let folders = folder_sync(&mut conn, &mut store, "0")?;
//!
//!     let mut store = Store;
//!     let mut collection = EmailSync::new(&mut store, "5", Lookback::OneWeek);
//!     let outcome = run_sync(&mut conn, &mut collection, "5", "0", |conn| {
//!         let mut store = Store;
//!         folder_sync(conn, &mut store, &folders.sync_key).map(|_| ())
//!     })?;
//!     println!("synced up to key {}", outcome.sync_key);
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod move_items;
pub mod operation;
pub mod protocol;
pub mod provision;
pub mod send;
pub mod sync;
pub mod tags;
pub mod wbxml;

pub use connection::{Connection, ConnectionBuilder, StopHandle, StopReason};
pub use error::{Error, Result};
pub use protocol::ProtocolVersion;

#[cfg(test)]
mod mock_transport;

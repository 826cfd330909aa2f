//! Uploads local message state (read and flag changes) with a one-round
//! Sync carrying `<Change>` commands.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::connection::{Connection, HttpResponse, Transport};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::{sync_status, ProtocolVersion};
use crate::sync::INITIAL_SYNC_KEY;
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// Wire format for the follow-up flag's timestamps.
const FLAG_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// A local state change to one message, pending upload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageStateChange {
    pub server_id: String,
    pub read: Option<bool>,
    pub flagged: Option<bool>,
}

impl MessageStateChange {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.flagged.is_none()
    }
}

/// What an upsync round accomplished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsyncOutcome {
    Done {
        /// The sync key to persist for the next call.
        sync_key: String,
        /// Per-item statuses the server reported; items the server accepted
        /// silently are absent.
        statuses: HashMap<String, u32>,
    },
    /// The server wants a folder hierarchy sync first; the changes were not
    /// applied and should be retried afterwards.
    FolderSyncNeeded,
}

/// Uploads read and flag state for messages in one collection.
///
/// Flag changes cannot be expressed on the 2.5 dialect and are dropped
/// there; read changes still go out.
pub fn upsync_message_state<T: Transport>(
    conn: &mut Connection<T>,
    collection_id: &str,
    sync_key: &str,
    changes: &[MessageStateChange],
) -> Result<UpsyncOutcome> {
    if sync_key.is_empty() || sync_key == INITIAL_SYNC_KEY {
        // An initial key means the server has never told us its item ids;
        // there is nothing these changes could refer to.
        return Err(Error::MalformedProtocol(
            "cannot upload message state before an initial sync".into(),
        ));
    }
    if changes.iter().all(MessageStateChange::is_empty) {
        debug!(collection_id, "no message state to upload");
        return Ok(UpsyncOutcome::Done {
            sync_key: sync_key.to_string(),
            statuses: HashMap::new(),
        });
    }

    let mut op = UpsyncOp {
        collection_id,
        sync_key,
        changes,
    };
    conn.run(&mut op)
}

struct UpsyncOp<'a> {
    collection_id: &'a str,
    sync_key: &'a str,
    changes: &'a [MessageStateChange],
}

impl Operation for UpsyncOp<'_> {
    type Output = UpsyncOutcome;

    fn command(&self) -> &'static str {
        "Sync"
    }

    fn request_body(&mut self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::SYNC_SYNC)?
            .start(tags::SYNC_COLLECTIONS)?
            .start(tags::SYNC_COLLECTION)?;
        if version < ProtocolVersion::V12_1 {
            s.data(tags::SYNC_CLASS, "Email")?;
        }
        s.data(tags::SYNC_SYNC_KEY, self.sync_key)?
            .data(tags::SYNC_COLLECTION_ID, self.collection_id)?
            .start(tags::SYNC_COMMANDS)?;

        for change in self.changes {
            write_change(&mut s, change, version, Utc::now())?;
        }

        s.end()?.end()?.end()?.end()?.done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        _version: ProtocolVersion,
    ) -> Result<UpsyncOutcome> {
        if response.is_empty() {
            // The server acknowledged without a body; the key stands.
            return Ok(UpsyncOutcome::Done {
                sync_key: self.sync_key.to_string(),
                statuses: HashMap::new(),
            });
        }

        let mut p = Parser::new(&response.body[..])?;
        p.expect_document_start(tags::SYNC_SYNC)?;

        let mut sync_key = self.sync_key.to_string();
        let mut statuses = HashMap::new();

        while let Token::Start(tag) = p.next_tag(tags::SYNC_SYNC)? {
            match tag {
                tags::SYNC_STATUS => {
                    let status = p.value_int()?;
                    if let Some(outcome) = classify(status)? {
                        return Ok(outcome);
                    }
                }
                tags::SYNC_COLLECTIONS => {
                    while let Token::Start(tag) = p.next_tag(tags::SYNC_COLLECTIONS)? {
                        if tag != tags::SYNC_COLLECTION {
                            p.skip_tag()?;
                            continue;
                        }
                        while let Token::Start(tag) = p.next_tag(tags::SYNC_COLLECTION)? {
                            match tag {
                                tags::SYNC_SYNC_KEY => sync_key = p.value()?,
                                tags::SYNC_STATUS => {
                                    let status = p.value_int()?;
                                    if let Some(outcome) = classify(status)? {
                                        return Ok(outcome);
                                    }
                                }
                                tags::SYNC_RESPONSES => {
                                    responses_parser(&mut p, &mut statuses)?;
                                }
                                _ => p.skip_tag()?,
                            }
                        }
                    }
                }
                _ => p.skip_tag()?,
            }
        }

        Ok(UpsyncOutcome::Done { sync_key, statuses })
    }
}

/// `Ok(None)` means the status is a success and parsing continues.
fn classify(status: u32) -> Result<Option<UpsyncOutcome>> {
    if status == sync_status::SUCCESS {
        return Ok(None);
    }
    if status == sync_status::FOLDER_SYNC_REQUIRED {
        return Ok(Some(UpsyncOutcome::FolderSyncNeeded));
    }
    Err(Error::CommandStatus {
        status,
        item_id: None,
    })
}

fn responses_parser(p: &mut Parser<&[u8]>, statuses: &mut HashMap<String, u32>) -> Result<()> {
    while let Token::Start(tag) = p.next_tag(tags::SYNC_RESPONSES)? {
        if tag != tags::SYNC_CHANGE {
            p.skip_tag()?;
            continue;
        }
        let mut server_id = None;
        let mut status = None;
        while let Token::Start(tag) = p.next_tag(tags::SYNC_CHANGE)? {
            match tag {
                tags::SYNC_SERVER_ID => server_id = Some(p.value()?),
                tags::SYNC_STATUS => status = Some(p.value_int()?),
                _ => p.skip_tag()?,
            }
        }
        if let (Some(id), Some(status)) = (server_id, status) {
            statuses.insert(id, status);
        }
    }
    Ok(())
}

/// Writes one `<Change>` entry; returns whether anything was written.
fn write_change(
    s: &mut Serializer<Vec<u8>>,
    change: &MessageStateChange,
    version: ProtocolVersion,
    now: DateTime<Utc>,
) -> Result<bool> {
    let flagged = if version >= ProtocolVersion::V12_0 {
        change.flagged
    } else {
        if change.flagged.is_some() {
            warn!(
                server_id = %change.server_id,
                "server dialect cannot carry flag changes, dropping"
            );
        }
        None
    };
    if change.read.is_none() && flagged.is_none() {
        return Ok(false);
    }

    s.start(tags::SYNC_CHANGE)?
        .data(tags::SYNC_SERVER_ID, &change.server_id)?
        .start(tags::SYNC_APPLICATION_DATA)?;
    if let Some(read) = change.read {
        s.data(tags::EMAIL_READ, if read { "1" } else { "0" })?;
    }
    match flagged {
        Some(true) => {
            // A set flag needs the full follow-up shape; servers refuse a
            // bare status. Start now, due in a week.
            let start = now.format(FLAG_DATE_FORMAT).to_string();
            let due = (now + Duration::weeks(1)).format(FLAG_DATE_FORMAT).to_string();
            s.start(tags::EMAIL_FLAG)?
                .data(tags::EMAIL_FLAG_STATUS, "2")?
                .data(tags::EMAIL_FLAG_TYPE, "FollowUp")?
                .data(tags::TASK_START_DATE, &start)?
                .data(tags::TASK_UTC_START_DATE, &start)?
                .data(tags::TASK_DUE_DATE, &due)?
                .data(tags::TASK_UTC_DUE_DATE, &due)?
                .end()?;
        }
        // Clearing is the degenerate element.
        Some(false) => {
            s.tag(tags::EMAIL_FLAG)?;
        }
        None => {}
    }
    s.end()?.end()?;
    Ok(true)
}

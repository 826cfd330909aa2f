//! The Email collection strategy: request options for mail folders, and the
//! parser that turns `<Commands>`/`<Responses>` blocks into calls on an
//! [`EmailSyncHandler`].

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{body_type, mime_support, truncation, Lookback, ProtocolVersion};
use crate::sync::{SyncCollection, MAX_WINDOW_SIZE};
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// Base number of messages per sync window; multiplied by the loop's growth
/// factor and clamped to [`MAX_WINDOW_SIZE`].
pub const EMAIL_WINDOW_SIZE: u32 = 10;

/// `LastVerbExecuted` values we care about.
const LAST_VERB_REPLY: u32 = 1;
const LAST_VERB_REPLY_ALL: u32 = 2;
const LAST_VERB_FORWARD: u32 = 3;

/// A message downloaded during a sync round.
#[derive(Clone, Debug, Default)]
pub struct MessageData {
    pub server_id: String,
    pub folder_server_id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub reply_to: Option<String>,
    pub date_received: Option<DateTime<Utc>>,
    pub thread_topic: Option<String>,
    /// Opaque conversation identifier, base64-encoded for storage.
    pub conversation_id: Option<String>,
    pub message_class: Option<String>,
    pub read: bool,
    pub flagged: bool,
    pub replied_to: bool,
    pub forwarded: bool,
    pub is_meeting_invite: bool,
    pub is_meeting_cancel: bool,
    /// Plain-text body, when the server sent one.
    pub text: Option<String>,
    /// HTML body, when the server sent one.
    pub html: Option<String>,
    /// Full MIME source, when the server sent one.
    pub mime: Option<Vec<u8>>,
    /// The body was cut off at the requested truncation size.
    pub truncated: bool,
    /// The body was withheld entirely; fetch it later by server id.
    pub partially_loaded: bool,
    pub attachments: Vec<AttachmentData>,
}

/// Attachment metadata from either the Email (2.5) or AirSyncBase (12.0+)
/// vocabulary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachmentData {
    pub file_name: String,
    pub size: u64,
    /// The server-side reference used to download the content later.
    pub location: String,
    pub mime_type: String,
    /// Set for inline images referenced from the HTML body.
    pub content_id: Option<String>,
}

/// Receives the item-level deltas of a mail sync. Implementations buffer
/// changes and apply them atomically in `commit_message_changes`.
pub trait EmailSyncHandler {
    fn add_message(&mut self, message: MessageData);
    fn remove_message(&mut self, server_id: &str);
    fn read_state_changed(&mut self, server_id: &str, read: bool);
    fn flag_state_changed(&mut self, server_id: &str, flagged: bool);
    fn message_replied_to(&mut self, server_id: &str);
    fn message_forwarded(&mut self, server_id: &str);
    fn commit_message_changes(&mut self);
}

/// The [`SyncCollection`] implementation for mail folders, to be driven by
/// [`run_sync`](crate::sync::run_sync).
pub struct EmailSync<'a, H: EmailSyncHandler> {
    handler: &'a mut H,
    folder_server_id: String,
    lookback: Lookback,
    deletes: Vec<String>,
    /// Deleting from a trash-like folder is permanent; elsewhere deletions
    /// move to trash server-side (`DeletesAsMoves`).
    permanent_deletes: bool,
    fetches: Vec<String>,
    item_statuses: HashMap<String, u32>,
}

impl<'a, H: EmailSyncHandler> EmailSync<'a, H> {
    pub fn new(handler: &'a mut H, folder_server_id: impl Into<String>, lookback: Lookback) -> Self {
        EmailSync {
            handler,
            folder_server_id: folder_server_id.into(),
            lookback,
            deletes: Vec::new(),
            permanent_deletes: false,
            fetches: Vec::new(),
            item_statuses: HashMap::new(),
        }
    }

    /// Queues deletions to upsync with the next round. `permanent` when the
    /// folder is trash-like, so the server doesn't move the items to trash
    /// again.
    pub fn with_deletes(mut self, server_ids: Vec<String>, permanent: bool) -> Self {
        self.deletes = server_ids;
        self.permanent_deletes = permanent;
        self
    }

    /// Queues body fetches for messages that were only partially loaded. A
    /// round with fetches requests no new changes.
    pub fn with_fetches(mut self, server_ids: Vec<String>) -> Self {
        self.fetches = server_ids;
        self
    }

    /// Per-item statuses from the server's `<Responses>` blocks, keyed by
    /// server id. Check [`sync_status::should_retry`]
    /// (crate::protocol::sync_status::should_retry) to classify failures.
    pub fn item_statuses(&self) -> &HashMap<String, u32> {
        &self.item_statuses
    }

    fn message_data_parser(
        &mut self,
        p: &mut Parser<&[u8]>,
        ending: tags::Tag,
        msg: &mut MessageData,
    ) -> Result<()> {
        let mut mime_truncated = false;
        while let Token::Start(tag) = p.next_tag(ending)? {
            match tag {
                tags::EMAIL_ATTACHMENTS | tags::BASE_ATTACHMENTS => {
                    attachments_parser(p, tag, &mut msg.attachments)?;
                }
                tags::EMAIL_TO => msg.to = Some(p.value()?),
                tags::EMAIL_FROM => msg.from = Some(p.value()?),
                tags::EMAIL_CC => msg.cc = Some(p.value()?),
                tags::EMAIL_REPLY_TO => msg.reply_to = Some(p.value()?),
                tags::EMAIL_DATE_RECEIVED => {
                    let raw = p.value()?;
                    match parse_email_date(&raw) {
                        Some(date) => msg.date_received = Some(date),
                        None => warn!(value = %raw, "unparseable DateReceived"),
                    }
                }
                tags::EMAIL_SUBJECT => msg.subject = Some(p.value()?),
                tags::EMAIL_READ => msg.read = p.value_int()? == 1,
                tags::BASE_BODY => body_parser(p, msg)?,
                tags::EMAIL_FLAG => msg.flagged = flag_parser(p)?,
                tags::EMAIL_MIME_TRUNCATED => {
                    mime_truncated = p.value_int()? == 1;
                    msg.truncated = mime_truncated;
                }
                tags::EMAIL_MIME_DATA => {
                    // 2.5 servers inline the MIME source here. A truncated
                    // body is useless as MIME; mark the message for a later
                    // fetch instead.
                    if mime_truncated {
                        p.value_bytes()?;
                        debug!(server_id = %msg.server_id, "partially loaded");
                        msg.partially_loaded = true;
                    } else {
                        msg.mime = Some(p.value_bytes()?);
                    }
                }
                tags::EMAIL_BODY => msg.text = Some(p.value()?),
                tags::EMAIL_MESSAGE_CLASS => {
                    let class = p.value()?;
                    if class == "IPM.Schedule.Meeting.Request" {
                        msg.is_meeting_invite = true;
                    } else if class == "IPM.Schedule.Meeting.Canceled" {
                        msg.is_meeting_cancel = true;
                    }
                    msg.message_class = Some(class);
                }
                tags::EMAIL_MEETING_REQUEST => p.skip_tag()?,
                tags::EMAIL_THREAD_TOPIC => msg.thread_topic = Some(p.value()?),
                tags::EMAIL2_CONVERSATION_ID => {
                    msg.conversation_id = Some(BASE64_URL.encode(p.value_bytes()?));
                }
                tags::EMAIL2_CONVERSATION_INDEX => {
                    // A position in the conversation tree; we don't build one.
                    p.value_bytes()?;
                }
                tags::EMAIL2_LAST_VERB_EXECUTED => match p.value_int()? {
                    LAST_VERB_REPLY | LAST_VERB_REPLY_ALL => msg.replied_to = true,
                    LAST_VERB_FORWARD => msg.forwarded = true,
                    _ => {}
                },
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    /// Parses one `<Add>` or `<Fetch>` entry. A non-success item status is
    /// returned as [`Error::CommandStatus`] carrying the server id.
    fn add_parser(&mut self, p: &mut Parser<&[u8]>, ending: tags::Tag) -> Result<()> {
        let mut status = 1;
        let mut msg = MessageData {
            folder_server_id: self.folder_server_id.clone(),
            ..MessageData::default()
        };
        while let Token::Start(tag) = p.next_tag(ending)? {
            match tag {
                tags::SYNC_SERVER_ID => msg.server_id = p.value()?,
                tags::SYNC_STATUS => status = p.value_int()?,
                tags::SYNC_APPLICATION_DATA => {
                    self.message_data_parser(p, tags::SYNC_APPLICATION_DATA, &mut msg)?;
                }
                _ => p.skip_tag()?,
            }
        }
        if status != 1 {
            return Err(Error::CommandStatus {
                status,
                item_id: Some(msg.server_id),
            });
        }
        if msg.text.is_none() && msg.html.is_none() && msg.mime.is_none() {
            // No body at all; whatever we store is incomplete.
            msg.truncated = true;
        }
        self.handler.add_message(msg);
        Ok(())
    }

    fn delete_parser(&mut self, p: &mut Parser<&[u8]>, ending: tags::Tag) -> Result<()> {
        while let Token::Start(tag) = p.next_tag(ending)? {
            match tag {
                tags::SYNC_SERVER_ID => {
                    let server_id = p.value()?;
                    self.handler.remove_message(&server_id);
                }
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    fn change_parser(&mut self, p: &mut Parser<&[u8]>) -> Result<()> {
        let mut server_id = None;
        while let Token::Start(tag) = p.next_tag(tags::SYNC_CHANGE)? {
            match tag {
                tags::SYNC_SERVER_ID => server_id = Some(p.value()?),
                tags::SYNC_APPLICATION_DATA => match &server_id {
                    Some(id) => self.change_data_parser(p, id.clone())?,
                    None => {
                        warn!("Change entry without a server id");
                        p.skip_tag()?;
                    }
                },
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    fn change_data_parser(&mut self, p: &mut Parser<&[u8]>, server_id: String) -> Result<()> {
        while let Token::Start(tag) = p.next_tag(tags::SYNC_APPLICATION_DATA)? {
            match tag {
                tags::EMAIL_READ => {
                    let read = p.value_int()? == 1;
                    self.handler.read_state_changed(&server_id, read);
                }
                tags::EMAIL_FLAG => {
                    let flagged = flag_parser(p)?;
                    self.handler.flag_state_changed(&server_id, flagged);
                }
                tags::EMAIL2_LAST_VERB_EXECUTED => match p.value_int()? {
                    LAST_VERB_REPLY | LAST_VERB_REPLY_ALL => {
                        self.handler.message_replied_to(&server_id);
                    }
                    LAST_VERB_FORWARD => self.handler.message_forwarded(&server_id),
                    _ => {}
                },
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    fn message_update_parser(&mut self, p: &mut Parser<&[u8]>, ending: tags::Tag) -> Result<()> {
        let mut server_id = None;
        let mut status = None;
        while let Token::Start(tag) = p.next_tag(ending)? {
            match tag {
                tags::SYNC_STATUS => status = Some(p.value_int()?),
                tags::SYNC_SERVER_ID => server_id = Some(p.value()?),
                _ => p.skip_tag()?,
            }
        }
        if let (Some(id), Some(status)) = (server_id, status) {
            self.item_statuses.insert(id, status);
        }
        Ok(())
    }
}

impl<H: EmailSyncHandler> SyncCollection for EmailSync<'_, H> {
    fn class_name(&self) -> &'static str {
        "Email"
    }

    fn write_request(
        &mut self,
        s: &mut Serializer<Vec<u8>>,
        version: ProtocolVersion,
        initial_sync: bool,
        num_windows: u32,
    ) -> Result<()> {
        if initial_sync {
            // The first round only establishes a sync key.
            return Ok(());
        }

        if self.fetches.is_empty() {
            s.data(
                tags::SYNC_DELETES_AS_MOVES,
                if self.permanent_deletes { "0" } else { "1" },
            )?;
            s.tag(tags::SYNC_GET_CHANGES)?;

            let window = num_windows * EMAIL_WINDOW_SIZE;
            if window > MAX_WINDOW_SIZE + EMAIL_WINDOW_SIZE {
                return Err(Error::SyncWindowExhausted);
            }
            s.data(
                tags::SYNC_WINDOW_SIZE,
                &window.min(MAX_WINDOW_SIZE).to_string(),
            )?;

            s.start(tags::SYNC_OPTIONS)?;
            s.data(tags::SYNC_FILTER_TYPE, self.lookback.filter_code())?;
            if version >= ProtocolVersion::V12_0 {
                s.data(tags::SYNC_MIME_SUPPORT, mime_support::ALWAYS)?;
                s.start(tags::BASE_BODY_PREFERENCE)?
                    .data(tags::BASE_TYPE, body_type::MIME)?
                    .data(tags::BASE_TRUNCATION_SIZE, truncation::EAS_12_SIZE)?
                    .end()?;
            } else {
                s.data(tags::SYNC_MIME_SUPPORT, mime_support::ALWAYS)?;
                s.data(tags::SYNC_MIME_TRUNCATION, truncation::EAS_2_5_NONE)?;
            }
            s.end()?;

            if !self.deletes.is_empty() {
                s.start(tags::SYNC_COMMANDS)?;
                for server_id in &self.deletes {
                    s.start(tags::SYNC_DELETE)?
                        .data(tags::SYNC_SERVER_ID, server_id)?
                        .end()?;
                }
                s.end()?;
            }
        } else {
            // Fetch-only round: re-request the missing bodies, untruncated,
            // and nothing else.
            s.start(tags::SYNC_OPTIONS)?
                .data(tags::SYNC_MIME_SUPPORT, mime_support::NEVER)?
                .data(tags::SYNC_TRUNCATION, truncation::EAS_2_5_NONE)?
                .end()?;
            s.start(tags::SYNC_COMMANDS)?;
            for server_id in &self.fetches {
                s.start(tags::SYNC_FETCH)?
                    .data(tags::SYNC_SERVER_ID, server_id)?
                    .end()?;
            }
            s.end()?;
        }
        Ok(())
    }

    fn parse_commands(&mut self, p: &mut Parser<&[u8]>) -> Result<()> {
        while let Token::Start(tag) = p.next_tag(tags::SYNC_COMMANDS)? {
            match tag {
                tags::SYNC_ADD => self.add_parser(p, tags::SYNC_ADD)?,
                tags::SYNC_DELETE | tags::SYNC_SOFT_DELETE => self.delete_parser(p, tag)?,
                tags::SYNC_CHANGE => self.change_parser(p)?,
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    fn parse_responses(&mut self, p: &mut Parser<&[u8]>) -> Result<()> {
        while let Token::Start(tag) = p.next_tag(tags::SYNC_RESPONSES)? {
            match tag {
                tags::SYNC_ADD | tags::SYNC_CHANGE | tags::SYNC_DELETE => {
                    self.message_update_parser(p, tag)?;
                }
                tags::SYNC_FETCH => match self.add_parser(p, tags::SYNC_FETCH) {
                    Ok(()) => {}
                    // Not found: the message is gone on the server; drop it
                    // locally rather than retrying the fetch forever.
                    Err(Error::CommandStatus {
                        status: 8,
                        item_id: Some(id),
                    }) => self.handler.remove_message(&id),
                    Err(Error::CommandStatus { status, item_id }) => {
                        warn!(status, ?item_id, "fetch refused");
                    }
                    Err(e) => return Err(e),
                },
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }

    fn commit(&mut self) {
        self.handler.commit_message_changes();
    }

    fn round_complete(&mut self) {
        // Deletes and fetches were delivered with the round that just ended;
        // don't send them again with the next window.
        self.deletes.clear();
        self.fetches.clear();
    }
}

fn flag_parser(p: &mut Parser<&[u8]>) -> Result<bool> {
    let mut flagged = false;
    while let Token::Start(tag) = p.next_tag(tags::EMAIL_FLAG)? {
        match tag {
            tags::EMAIL_FLAG_STATUS => flagged = p.value_int()? == 2,
            _ => p.skip_tag()?,
        }
    }
    Ok(flagged)
}

fn body_parser(p: &mut Parser<&[u8]>, msg: &mut MessageData) -> Result<()> {
    let mut kind = body_type::TEXT.to_string();
    while let Token::Start(tag) = p.next_tag(tags::BASE_BODY)? {
        match tag {
            tags::BASE_TYPE => kind = p.value()?,
            tags::BASE_DATA => {
                if kind == body_type::HTML {
                    msg.html = Some(p.value()?);
                } else if kind == body_type::MIME {
                    msg.mime = Some(p.value_bytes()?);
                } else {
                    msg.text = Some(p.value()?);
                }
            }
            tags::BASE_TRUNCATED => msg.truncated = p.value_int()? == 1,
            _ => p.skip_tag()?,
        }
    }
    Ok(())
}

fn attachments_parser(
    p: &mut Parser<&[u8]>,
    ending: tags::Tag,
    out: &mut Vec<AttachmentData>,
) -> Result<()> {
    while let Token::Start(tag) = p.next_tag(ending)? {
        match tag {
            tags::EMAIL_ATTACHMENT | tags::BASE_ATTACHMENT => attachment_parser(p, tag, out)?,
            _ => p.skip_tag()?,
        }
    }
    Ok(())
}

fn attachment_parser(
    p: &mut Parser<&[u8]>,
    ending: tags::Tag,
    out: &mut Vec<AttachmentData>,
) -> Result<()> {
    let mut file_name = None;
    let mut size = None;
    let mut location = None;
    let mut is_inline = false;
    let mut content_id = None;

    while let Token::Start(tag) = p.next_tag(ending)? {
        match tag {
            // Both the 2.5 and 12.0+ vocabularies land here.
            tags::EMAIL_DISPLAY_NAME | tags::BASE_DISPLAY_NAME => file_name = Some(p.value()?),
            tags::EMAIL_ATT_NAME | tags::BASE_FILE_REFERENCE => location = Some(p.value()?),
            tags::EMAIL_ATT_SIZE | tags::BASE_ESTIMATED_DATA_SIZE => {
                size = Some(u64::from(p.value_int()?));
            }
            tags::BASE_IS_INLINE => is_inline = p.value_int()? == 1,
            tags::BASE_CONTENT_ID => content_id = Some(p.value()?),
            _ => p.skip_tag()?,
        }
    }

    if let (Some(file_name), Some(size), Some(location)) = (file_name, size, location) {
        let mime_type = mime_type_from_file_name(&file_name);
        out.push(AttachmentData {
            // Inline images arrive with ContentId (not ContentLocation, as
            // the protocol docs claim) on every Exchange version seen.
            content_id: content_id.filter(|_| is_inline),
            file_name,
            size,
            location,
            mime_type,
        });
    }
    Ok(())
}

fn mime_type_from_file_name(file_name: &str) -> String {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty());
    let Some(extension) = extension else {
        return "application/octet-stream".to_string();
    };
    match extension.as_str() {
        "txt" => "text/plain".into(),
        "htm" | "html" => "text/html".into(),
        "jpg" | "jpeg" => "image/jpeg".into(),
        "png" => "image/png".into(),
        "gif" => "image/gif".into(),
        "pdf" => "application/pdf".into(),
        "zip" => "application/zip".into(),
        "eml" => "message/rfc822".into(),
        other => format!("application/{}", other),
    }
}

/// Parses the `DateReceived` timestamp format, with and without
/// milliseconds.
fn parse_email_date(value: &str) -> Option<DateTime<Utc>> {
    for format in ["%Y-%m-%dT%H:%M:%S%.3fZ", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wbxml::Serializer;

    #[derive(Default)]
    struct Recorder {
        added: Vec<MessageData>,
        removed: Vec<String>,
        read_changes: Vec<(String, bool)>,
        flag_changes: Vec<(String, bool)>,
        replied: Vec<String>,
        forwarded: Vec<String>,
        commits: u32,
    }

    impl EmailSyncHandler for Recorder {
        fn add_message(&mut self, message: MessageData) {
            self.added.push(message);
        }
        fn remove_message(&mut self, server_id: &str) {
            self.removed.push(server_id.to_string());
        }
        fn read_state_changed(&mut self, server_id: &str, read: bool) {
            self.read_changes.push((server_id.to_string(), read));
        }
        fn flag_state_changed(&mut self, server_id: &str, flagged: bool) {
            self.flag_changes.push((server_id.to_string(), flagged));
        }
        fn message_replied_to(&mut self, server_id: &str) {
            self.replied.push(server_id.to_string());
        }
        fn message_forwarded(&mut self, server_id: &str) {
            self.forwarded.push(server_id.to_string());
        }
        fn commit_message_changes(&mut self) {
            self.commits += 1;
        }
    }

    /// Wraps `commands` in the Sync envelope and runs it through the
    /// strategy's parser.
    fn parse_with<F>(handler: &mut Recorder, build: F) -> HashMap<String, u32>
    where
        F: FnOnce(&mut Serializer<Vec<u8>>),
    {
        let mut s = Serializer::new(Vec::new()).unwrap();
        s.start(tags::SYNC_SYNC)
            .unwrap()
            .start(tags::SYNC_COLLECTIONS)
            .unwrap()
            .start(tags::SYNC_COLLECTION)
            .unwrap();
        s.data(tags::SYNC_SYNC_KEY, "2").unwrap();
        s.data(tags::SYNC_STATUS, "1").unwrap();
        build(&mut s);
        s.end().unwrap().end().unwrap().end().unwrap();
        s.done().unwrap();
        let body = s.into_inner();

        let mut email = EmailSync::new(handler, "folder1", Lookback::OneWeek);
        let mut p = Parser::new(&body[..]).unwrap();
        p.expect_document_start(tags::SYNC_SYNC).unwrap();
        while let Token::Start(tag) = p.next_tag(tags::SYNC_SYNC).unwrap() {
            match tag {
                tags::SYNC_COLLECTIONS => {
                    while let Token::Start(tag) = p.next_tag(tags::SYNC_COLLECTIONS).unwrap() {
                        assert_eq!(tag, tags::SYNC_COLLECTION);
                        while let Token::Start(tag) = p.next_tag(tags::SYNC_COLLECTION).unwrap() {
                            match tag {
                                tags::SYNC_COMMANDS => email.parse_commands(&mut p).unwrap(),
                                tags::SYNC_RESPONSES => email.parse_responses(&mut p).unwrap(),
                                _ => p.skip_tag().unwrap(),
                            }
                        }
                    }
                }
                _ => p.skip_tag().unwrap(),
            }
        }
        email.commit();
        email.item_statuses().clone()
    }

    #[test]
    fn add_command_builds_a_message() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_COMMANDS).unwrap();
            s.start(tags::SYNC_ADD).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:5").unwrap();
            s.start(tags::SYNC_APPLICATION_DATA).unwrap();
            s.data(tags::EMAIL_FROM, "Alice <alice@example.org>").unwrap();
            s.data(tags::EMAIL_TO, "bob@example.org").unwrap();
            s.data(tags::EMAIL_SUBJECT, "hello").unwrap();
            s.data(tags::EMAIL_DATE_RECEIVED, "2024-03-01T10:15:30.000Z")
                .unwrap();
            s.data(tags::EMAIL_READ, "1").unwrap();
            s.start(tags::BASE_BODY).unwrap();
            s.data(tags::BASE_TYPE, "1").unwrap();
            s.data(tags::BASE_DATA, "body text").unwrap();
            s.end().unwrap();
            s.end().unwrap(); // ApplicationData
            s.end().unwrap(); // Add
            s.end().unwrap(); // Commands
        });

        assert_eq!(handler.added.len(), 1);
        let msg = &handler.added[0];
        assert_eq!(msg.server_id, "1:5");
        assert_eq!(msg.folder_server_id, "folder1");
        assert_eq!(msg.subject.as_deref(), Some("hello"));
        assert_eq!(msg.from.as_deref(), Some("Alice <alice@example.org>"));
        assert!(msg.read);
        assert_eq!(msg.text.as_deref(), Some("body text"));
        assert!(!msg.truncated);
        assert_eq!(
            msg.date_received.map(|d| d.timestamp()),
            Some(1709288130)
        );
        assert_eq!(handler.commits, 1);
    }

    #[test]
    fn message_without_a_body_is_marked_truncated() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_COMMANDS).unwrap();
            s.start(tags::SYNC_ADD).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:9").unwrap();
            s.start(tags::SYNC_APPLICATION_DATA).unwrap();
            s.data(tags::EMAIL_SUBJECT, "no body").unwrap();
            s.end().unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert!(handler.added[0].truncated);
    }

    #[test]
    fn attachment_metadata_is_collected() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_COMMANDS).unwrap();
            s.start(tags::SYNC_ADD).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:6").unwrap();
            s.start(tags::SYNC_APPLICATION_DATA).unwrap();
            s.start(tags::BASE_ATTACHMENTS).unwrap();
            s.start(tags::BASE_ATTACHMENT).unwrap();
            s.data(tags::BASE_DISPLAY_NAME, "report.pdf").unwrap();
            s.data(tags::BASE_FILE_REFERENCE, "att-77").unwrap();
            s.data(tags::BASE_ESTIMATED_DATA_SIZE, "2048").unwrap();
            s.end().unwrap();
            s.end().unwrap();
            s.end().unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert_eq!(
            handler.added[0].attachments,
            vec![AttachmentData {
                file_name: "report.pdf".into(),
                size: 2048,
                location: "att-77".into(),
                mime_type: "application/pdf".into(),
                content_id: None,
            }]
        );
    }

    #[test]
    fn flag_status_two_means_flagged() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_COMMANDS).unwrap();
            s.start(tags::SYNC_CHANGE).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:5").unwrap();
            s.start(tags::SYNC_APPLICATION_DATA).unwrap();
            s.start(tags::EMAIL_FLAG).unwrap();
            s.data(tags::EMAIL_FLAG_STATUS, "2").unwrap();
            s.end().unwrap();
            s.data(tags::EMAIL_READ, "0").unwrap();
            s.end().unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert_eq!(handler.flag_changes, vec![("1:5".into(), true)]);
        assert_eq!(handler.read_changes, vec![("1:5".into(), false)]);
    }

    #[test]
    fn delete_and_soft_delete_remove_messages() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_COMMANDS).unwrap();
            s.start(tags::SYNC_DELETE).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:5").unwrap();
            s.end().unwrap();
            s.start(tags::SYNC_SOFT_DELETE).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:6").unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert_eq!(handler.removed, vec!["1:5".to_string(), "1:6".to_string()]);
    }

    #[test]
    fn response_statuses_are_collected_per_item() {
        let mut handler = Recorder::default();
        let statuses = parse_with(&mut handler, |s| {
            s.start(tags::SYNC_RESPONSES).unwrap();
            s.start(tags::SYNC_DELETE).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:5").unwrap();
            s.data(tags::SYNC_STATUS, "16").unwrap();
            s.end().unwrap();
            s.start(tags::SYNC_CHANGE).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:6").unwrap();
            s.data(tags::SYNC_STATUS, "1").unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert_eq!(statuses.get("1:5"), Some(&16));
        assert_eq!(statuses.get("1:6"), Some(&1));
    }

    #[test]
    fn fetch_not_found_removes_the_message() {
        let mut handler = Recorder::default();
        parse_with(&mut handler, |s| {
            s.start(tags::SYNC_RESPONSES).unwrap();
            s.start(tags::SYNC_FETCH).unwrap();
            s.data(tags::SYNC_SERVER_ID, "1:5").unwrap();
            s.data(tags::SYNC_STATUS, "8").unwrap();
            s.end().unwrap();
            s.end().unwrap();
        });

        assert_eq!(handler.removed, vec!["1:5".to_string()]);
        assert!(handler.added.is_empty());
    }

    fn request_for(
        email: &mut EmailSync<'_, Recorder>,
        version: ProtocolVersion,
        initial: bool,
        num_windows: u32,
    ) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::SYNC_SYNC)?;
        email.write_request(&mut s, version, initial, num_windows)?;
        s.end()?.done()?;
        Ok(s.into_inner())
    }

    #[test]
    fn initial_sync_requests_nothing_but_a_key() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek);
        let body = request_for(&mut email, ProtocolVersion::V14_1, true, 1).unwrap();
        // Just the header and the degenerate <Sync/> element.
        assert_eq!(body, vec![3, 1, 106, 0, tags::SYNC_SYNC.code()]);
    }

    #[test]
    fn incremental_request_carries_window_and_filter() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneMonth);
        let body = request_for(&mut email, ProtocolVersion::V14_1, false, 3).unwrap();

        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        // WindowSize 3 * 10 = 30, and the one-month filter code.
        assert!(contains(b"30\0"));
        assert!(contains(b"5\0"));
        assert!(contains(b"200000\0"));
    }

    #[test]
    fn window_is_clamped_to_the_cap() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek);
        let body = request_for(&mut email, ProtocolVersion::V14_1, false, 52).unwrap();
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        // 52 * 10 = 520 exceeds the cap, but is within one growth step of
        // it, so the request clamps to 512.
        assert!(contains(b"512\0"));
    }

    #[test]
    fn window_past_the_cap_plus_one_step_fails() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek);
        let err = request_for(&mut email, ProtocolVersion::V14_1, false, 53).unwrap_err();
        assert!(matches!(err, Error::SyncWindowExhausted));
    }

    #[test]
    fn deletes_are_embedded_and_cleared_after_the_round() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek)
            .with_deletes(vec!["1:5".into()], true);
        let body = request_for(&mut email, ProtocolVersion::V14_1, false, 1).unwrap();
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        assert!(contains(b"1:5\0"));
        // Trash folder: DeletesAsMoves is "0".
        assert!(contains(&[
            tags::SYNC_DELETES_AS_MOVES.code() | 0x40,
            0x03,
            b'0',
            0,
        ]));

        email.round_complete();
        let body = request_for(&mut email, ProtocolVersion::V14_1, false, 1).unwrap();
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        assert!(!contains(b"1:5\0"));
    }

    #[test]
    fn fetch_round_requests_only_the_fetches() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek)
            .with_fetches(vec!["1:9".into()]);
        let body = request_for(&mut email, ProtocolVersion::V14_1, false, 1).unwrap();
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        assert!(contains(b"1:9\0"));
        // No GetChanges and no window in a fetch round.
        assert!(!body.contains(&(tags::SYNC_GET_CHANGES.code() | 0x40)));
        assert!(!body.contains(&tags::SYNC_GET_CHANGES.code()));
    }

    #[test]
    fn old_dialect_asks_for_inline_mime() {
        let mut handler = Recorder::default();
        let mut email = EmailSync::new(&mut handler, "folder1", Lookback::OneWeek);
        let body = request_for(&mut email, ProtocolVersion::V2_5, false, 1).unwrap();
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        // MIMETruncation "7" (no truncation) instead of a BodyPreference.
        assert!(contains(&[
            tags::SYNC_MIME_TRUNCATION.code() | 0x40,
            0x03,
            b'7',
            0,
        ]));
        assert!(!body.contains(&tags::pages::BASE));
    }

    #[test]
    fn email_dates_parse_with_and_without_millis() {
        assert!(parse_email_date("2024-03-01T10:15:30.000Z").is_some());
        assert!(parse_email_date("2024-03-01T10:15:30Z").is_some());
        assert!(parse_email_date("not a date").is_none());
    }
}

//! The FolderSync command: downloads changes to the folder hierarchy.

use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::{Connection, HttpResponse, Transport, COMMAND_TIMEOUT, INITIAL_SYNC_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{folder_status, status_needs_provisioning, FolderType, ProtocolVersion};
use crate::sync::INITIAL_SYNC_KEY;
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// One folder in the server's hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderData {
    pub server_id: String,
    /// `"0"` for folders at the root of the mailbox.
    pub parent_id: String,
    pub display_name: String,
    pub folder_type: FolderType,
}

/// Receives the hierarchy deltas of a FolderSync. Implementations buffer
/// changes and apply them atomically in `commit_folder_changes`.
pub trait FolderSyncHandler {
    fn add_folder(&mut self, folder: FolderData);
    fn remove_folder(&mut self, server_id: &str);
    fn change_folder(&mut self, folder: FolderData);
    /// The server rejected our hierarchy sync key; all local folder state is
    /// stale and must go before the fresh hierarchy arrives.
    fn clear_folders(&mut self);
    fn commit_folder_changes(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderSyncOutcome {
    /// The hierarchy sync key to persist for the next call.
    pub sync_key: String,
    /// The server invalidated our previous key, so the hierarchy was rebuilt
    /// from scratch; per-folder sync state is stale and every collection
    /// needs a fresh sync.
    pub needs_full_resync: bool,
}

/// Synchronizes the folder hierarchy. `sync_key` is the caller's persisted
/// hierarchy key (empty or `"0"` for a first sync).
pub fn folder_sync<T, H>(
    conn: &mut Connection<T>,
    handler: &mut H,
    sync_key: &str,
) -> Result<FolderSyncOutcome>
where
    T: Transport,
    H: FolderSyncHandler,
{
    let mut key = if sync_key.is_empty() {
        INITIAL_SYNC_KEY.to_string()
    } else {
        sync_key.to_string()
    };
    let mut restarted = false;

    // Starting from scratch: whatever folders the caller still holds predate
    // this hierarchy and must go before the adds arrive.
    if key == INITIAL_SYNC_KEY {
        handler.clear_folders();
    }

    loop {
        let mut op = FolderSyncOp {
            handler: &mut *handler,
            sync_key: &key,
        };
        match conn.run(&mut op)? {
            Response::Done { sync_key } => {
                return Ok(FolderSyncOutcome {
                    sync_key,
                    needs_full_resync: restarted,
                });
            }
            Response::InvalidSyncKey => {
                if restarted {
                    // Even a fresh key was refused; the server is confused.
                    return Err(Error::CommandStatus {
                        status: folder_status::INVALID_SYNC_KEY,
                        item_id: None,
                    });
                }
                debug!("hierarchy sync key rejected, starting over");
                handler.clear_folders();
                key = INITIAL_SYNC_KEY.to_string();
                restarted = true;
            }
        }
    }
}

enum Response {
    Done { sync_key: String },
    InvalidSyncKey,
}

struct FolderSyncOp<'a, H: FolderSyncHandler> {
    handler: &'a mut H,
    sync_key: &'a str,
}

impl<H: FolderSyncHandler> crate::operation::Operation for FolderSyncOp<'_, H> {
    type Output = Response;

    fn command(&self) -> &'static str {
        "FolderSync"
    }

    fn timeout(&self) -> Duration {
        if self.sync_key == INITIAL_SYNC_KEY {
            INITIAL_SYNC_TIMEOUT
        } else {
            COMMAND_TIMEOUT
        }
    }

    // Some servers answer FolderSync with a plain 403 when what they want is
    // a provisioning round.
    fn forbidden_means_provisioning(&self) -> bool {
        true
    }

    fn request_body(&mut self, _version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::FOLDER_FOLDER_SYNC)?
            .data(tags::FOLDER_SYNC_KEY, self.sync_key)?
            .end()?
            .done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        _version: ProtocolVersion,
    ) -> Result<Response> {
        let mut p = Parser::new(&response.body[..])?;
        p.expect_document_start(tags::FOLDER_FOLDER_SYNC)?;

        let mut sync_key = self.sync_key.to_string();

        while let Token::Start(tag) = p.next_tag(tags::FOLDER_FOLDER_SYNC)? {
            match tag {
                tags::FOLDER_STATUS => {
                    let status = p.value_int()?;
                    if status == folder_status::INVALID_SYNC_KEY {
                        return Ok(Response::InvalidSyncKey);
                    }
                    if status_needs_provisioning(status) {
                        return Err(Error::ProvisioningRequired);
                    }
                    if status != folder_status::OK {
                        warn!(status, "folder sync refused");
                        return Err(Error::CommandStatus {
                            status,
                            item_id: None,
                        });
                    }
                }
                tags::FOLDER_SYNC_KEY => sync_key = p.value()?,
                tags::FOLDER_CHANGES => self.changes_parser(&mut p)?,
                _ => p.skip_tag()?,
            }
        }

        self.handler.commit_folder_changes();
        Ok(Response::Done { sync_key })
    }
}

impl<H: FolderSyncHandler> FolderSyncOp<'_, H> {
    fn changes_parser(&mut self, p: &mut Parser<&[u8]>) -> Result<()> {
        while let Token::Start(tag) = p.next_tag(tags::FOLDER_CHANGES)? {
            match tag {
                tags::FOLDER_ADD => {
                    if let Some(folder) = folder_parser(p, tags::FOLDER_ADD)? {
                        self.handler.add_folder(folder);
                    }
                }
                tags::FOLDER_UPDATE => {
                    if let Some(folder) = folder_parser(p, tags::FOLDER_UPDATE)? {
                        self.handler.change_folder(folder);
                    }
                }
                tags::FOLDER_DELETE => {
                    while let Token::Start(tag) = p.next_tag(tags::FOLDER_DELETE)? {
                        match tag {
                            tags::FOLDER_SERVER_ID => {
                                let server_id = p.value()?;
                                self.handler.remove_folder(&server_id);
                            }
                            _ => p.skip_tag()?,
                        }
                    }
                }
                tags::FOLDER_COUNT => {
                    p.value_int()?;
                }
                _ => p.skip_tag()?,
            }
        }
        Ok(())
    }
}

fn folder_parser(p: &mut Parser<&[u8]>, ending: tags::Tag) -> Result<Option<FolderData>> {
    let mut server_id = None;
    let mut parent_id = None;
    let mut display_name = None;
    let mut folder_type = None;

    while let Token::Start(tag) = p.next_tag(ending)? {
        match tag {
            tags::FOLDER_SERVER_ID => server_id = Some(p.value()?),
            tags::FOLDER_PARENT_ID => parent_id = Some(p.value()?),
            tags::FOLDER_DISPLAY_NAME => display_name = Some(p.value()?),
            tags::FOLDER_TYPE => folder_type = Some(FolderType::from_code(p.value_int()?)),
            _ => p.skip_tag()?,
        }
    }

    match (server_id, display_name, folder_type) {
        (Some(server_id), Some(display_name), Some(folder_type)) => Ok(Some(FolderData {
            server_id,
            parent_id: parent_id.unwrap_or_else(|| "0".to_string()),
            display_name,
            folder_type,
        })),
        _ => {
            warn!("folder entry missing id, name, or type");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::mock_transport::MockTransport;

    #[derive(Default)]
    struct Recorder {
        added: Vec<FolderData>,
        removed: Vec<String>,
        changed: Vec<FolderData>,
        clears: u32,
        commits: u32,
    }

    impl FolderSyncHandler for Recorder {
        fn add_folder(&mut self, folder: FolderData) {
            self.added.push(folder);
        }
        fn remove_folder(&mut self, server_id: &str) {
            self.removed.push(server_id.to_string());
        }
        fn change_folder(&mut self, folder: FolderData) {
            self.changed.push(folder);
        }
        fn clear_folders(&mut self) {
            self.clears += 1;
        }
        fn commit_folder_changes(&mut self) {
            self.commits += 1;
        }
    }

    fn connection(transport: MockTransport) -> Connection<MockTransport> {
        crate::mock_transport::init_tracing();
        ConnectionBuilder::new("mail.example.org", "user", "pw")
            .device_id("device1")
            .build_with_transport(transport)
    }

    fn folder(s: &mut Serializer<Vec<u8>>, kind: tags::Tag, id: &str, name: &str, typ: &str) {
        s.start(kind).unwrap();
        s.data(tags::FOLDER_SERVER_ID, id).unwrap();
        s.data(tags::FOLDER_PARENT_ID, "0").unwrap();
        s.data(tags::FOLDER_DISPLAY_NAME, name).unwrap();
        s.data(tags::FOLDER_TYPE, typ).unwrap();
        s.end().unwrap();
    }

    fn response_with_changes<F>(status: u32, sync_key: &str, build: F) -> Vec<u8>
    where
        F: FnOnce(&mut Serializer<Vec<u8>>),
    {
        let mut s = Serializer::new(Vec::new()).unwrap();
        s.start(tags::FOLDER_FOLDER_SYNC).unwrap();
        s.data(tags::FOLDER_STATUS, &status.to_string()).unwrap();
        s.data(tags::FOLDER_SYNC_KEY, sync_key).unwrap();
        s.start(tags::FOLDER_CHANGES).unwrap();
        build(&mut s);
        s.end().unwrap(); // Changes
        s.end().unwrap(); // FolderSync
        s.done().unwrap();
        s.into_inner()
    }

    #[test]
    fn adds_deletes_and_updates_arrive_in_order() {
        let body = response_with_changes(1, "7", |s| {
            s.data(tags::FOLDER_COUNT, "3").unwrap();
            folder(s, tags::FOLDER_ADD, "1", "Inbox", "2");
            s.start(tags::FOLDER_DELETE).unwrap();
            s.data(tags::FOLDER_SERVER_ID, "4").unwrap();
            s.end().unwrap();
            folder(s, tags::FOLDER_UPDATE, "2", "Archive", "12");
        });
        let mut conn = connection(MockTransport::new().with_body(body));
        let mut handler = Recorder::default();

        let outcome = folder_sync(&mut conn, &mut handler, "6").unwrap();

        assert_eq!(outcome.sync_key, "7");
        assert!(!outcome.needs_full_resync);
        assert_eq!(handler.added.len(), 1);
        assert_eq!(
            handler.added[0],
            FolderData {
                server_id: "1".into(),
                parent_id: "0".into(),
                display_name: "Inbox".into(),
                folder_type: FolderType::Inbox,
            }
        );
        assert_eq!(handler.removed, vec!["4".to_string()]);
        assert_eq!(handler.changed[0].display_name, "Archive");
        assert_eq!(handler.changed[0].folder_type, FolderType::UserMail);
        assert_eq!(handler.commits, 1);
        assert_eq!(handler.clears, 0);
    }

    #[test]
    fn initial_sync_clears_the_handler_before_applying_adds() {
        let body = response_with_changes(1, "1", |s| {
            folder(s, tags::FOLDER_ADD, "1", "Inbox", "2");
        });
        let mut conn = connection(MockTransport::new().with_body(body));
        let mut handler = Recorder::default();

        let outcome = folder_sync(&mut conn, &mut handler, "0").unwrap();

        assert_eq!(outcome.sync_key, "1");
        assert_eq!(handler.clears, 1);
        assert_eq!(handler.added.len(), 1);
    }

    #[test]
    fn invalid_sync_key_clears_and_restarts_from_scratch() {
        let refused = response_with_changes(9, "x", |_| {});
        let fresh = response_with_changes(1, "1", |s| {
            folder(s, tags::FOLDER_ADD, "1", "Inbox", "2");
        });
        let mut conn = connection(MockTransport::new().with_body(refused).with_body(fresh));
        let mut handler = Recorder::default();

        let outcome = folder_sync(&mut conn, &mut handler, "42").unwrap();

        assert_eq!(outcome.sync_key, "1");
        assert!(outcome.needs_full_resync);
        assert_eq!(handler.clears, 1);
        assert_eq!(handler.added.len(), 1);

        // The retry went out with the zero key.
        let requests = conn.transport().requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].body.windows(2).any(|w| w == b"0\0"));
    }

    #[test]
    fn repeated_invalid_sync_key_gives_up() {
        let transport = MockTransport::new()
            .with_body(response_with_changes(9, "x", |_| {}))
            .with_body(response_with_changes(9, "x", |_| {}));
        let mut conn = connection(transport);
        let mut handler = Recorder::default();

        let err = folder_sync(&mut conn, &mut handler, "42").unwrap_err();
        assert!(matches!(err, Error::CommandStatus { status: 9, .. }));
        assert_eq!(handler.clears, 1);
    }

    #[test]
    fn provisioning_range_status_asks_for_provisioning() {
        let body = response_with_changes(142, "x", |_| {});
        let mut conn = connection(MockTransport::new().with_body(body));
        let mut handler = Recorder::default();

        let err = folder_sync(&mut conn, &mut handler, "6").unwrap_err();
        assert!(matches!(err, Error::ProvisioningRequired));
    }

    #[test]
    fn http_forbidden_asks_for_provisioning() {
        let mut conn = connection(MockTransport::new().with_status(403));
        let mut handler = Recorder::default();

        let err = folder_sync(&mut conn, &mut handler, "6").unwrap_err();
        assert!(matches!(err, Error::ProvisioningRequired));
    }

    #[test]
    fn malformed_folder_entries_are_dropped() {
        let body = response_with_changes(1, "7", |s| {
            s.start(tags::FOLDER_ADD).unwrap();
            s.data(tags::FOLDER_SERVER_ID, "1").unwrap();
            // No display name or type.
            s.end().unwrap();
        });
        let mut conn = connection(MockTransport::new().with_body(body));
        let mut handler = Recorder::default();

        let outcome = folder_sync(&mut conn, &mut handler, "6").unwrap();
        assert_eq!(outcome.sync_key, "7");
        assert!(handler.added.is_empty());
    }
}

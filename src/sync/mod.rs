//! The windowed Sync state machine shared by every collection type.
//!
//! One call to [`run_sync`] performs as many request/response rounds as the
//! server needs to drain the collection's changes, growing the requested
//! window only while the server keeps answering with the same sync key and
//! `MoreAvailable`, and resetting it as soon as the key moves forward.

pub mod email;
pub mod folders;
pub mod upsync;

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::connection::{Connection, HttpResponse, Transport, COMMAND_TIMEOUT, INITIAL_SYNC_TIMEOUT};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::{sync_status, ProtocolVersion};
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// The largest item window ever requested from a server.
pub const MAX_WINDOW_SIZE: u32 = 512;

/// The sync key that means "I have no state; start from scratch".
pub const INITIAL_SYNC_KEY: &str = "0";

/// Per-collection-type behavior plugged into the shared sync machine: what
/// to put inside `<Collection>`, and how to apply the `<Commands>` and
/// `<Responses>` blocks of the answer.
pub trait SyncCollection {
    /// The collection class, e.g. `"Email"`. Sent explicitly on dialects
    /// before 12.1.
    fn class_name(&self) -> &'static str;

    /// Writes everything that follows `CollectionId` inside `<Collection>`:
    /// options, window size, pending client-side commands. `num_windows` is
    /// the current growth factor; implementations with a windowed payload
    /// must fail with [`Error::SyncWindowExhausted`] once their window would
    /// exceed [`MAX_WINDOW_SIZE`] plus one growth step.
    fn write_request(
        &mut self,
        s: &mut Serializer<Vec<u8>>,
        version: ProtocolVersion,
        initial_sync: bool,
        num_windows: u32,
    ) -> Result<()>;

    /// Applies the contents of a `<Commands>` block. The parser is
    /// positioned just inside the element; implementations loop with
    /// `next_tag(tags::SYNC_COMMANDS)` until it closes.
    fn parse_commands(&mut self, parser: &mut Parser<&[u8]>) -> Result<()>;

    /// Applies the contents of a `<Responses>` block, positioned the same
    /// way as [`SyncCollection::parse_commands`].
    fn parse_responses(&mut self, parser: &mut Parser<&[u8]>) -> Result<()>;

    /// One response document has been fully parsed; flush whatever the
    /// implementation buffered.
    fn commit(&mut self);

    /// One request/response round finished (after `commit`); reset any
    /// request-scoped state before the next window.
    fn round_complete(&mut self) {}
}

/// What a full [`run_sync`] call accomplished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The sync key to persist for the next call.
    pub sync_key: String,
    /// How many request/response rounds were needed.
    pub rounds: u32,
}

/// Result of one parsed response document.
enum RoundOutcome {
    /// An empty body: the server has nothing to report.
    NoChanges,
    /// Changes were applied; here is where the collection stands now.
    Applied {
        sync_key: Option<String>,
        more_available: bool,
    },
    /// The server wants a folder hierarchy sync before it will serve this
    /// collection.
    FolderSyncNeeded,
    /// The server refused the round with this status.
    Failed { status: u32 },
}

/// Drains all pending changes for one collection.
///
/// `sync_key` is the caller's persisted key (empty or `"0"` for a first
/// sync). When the server demands a folder hierarchy sync mid-stream,
/// `on_folder_sync_required` is invoked once and the round is retried; the
/// caller decides what a folder sync means for its state.
///
/// On [`Error::CommandStatus`] with status 3 the server rejected our sync
/// key; the caller must discard its local state for this collection and
/// start over from [`INITIAL_SYNC_KEY`].
pub fn run_sync<T, C, F>(
    conn: &mut Connection<T>,
    collection: &mut C,
    collection_id: &str,
    sync_key: &str,
    mut on_folder_sync_required: F,
) -> Result<SyncOutcome>
where
    T: Transport,
    C: SyncCollection,
    F: FnMut(&mut Connection<T>) -> Result<()>,
{
    let mut key = if sync_key.is_empty() {
        INITIAL_SYNC_KEY.to_string()
    } else {
        sync_key.to_string()
    };
    let mut num_windows = 1u32;
    let mut rounds = 0u32;
    let mut folder_synced = false;

    loop {
        let initial_sync = key == INITIAL_SYNC_KEY;
        let outcome = {
            let mut op = SyncOp {
                collection: &mut *collection,
                collection_id,
                sync_key: &key,
                initial_sync,
                num_windows,
            };
            conn.run(&mut op)?
        };
        rounds += 1;
        collection.round_complete();

        match outcome {
            RoundOutcome::NoChanges => {
                debug!(collection_id, rounds, "server reports no changes");
                return Ok(SyncOutcome { sync_key: key, rounds });
            }
            RoundOutcome::FolderSyncNeeded => {
                if folder_synced {
                    // We already refreshed folders once; the server keeps
                    // demanding it, so stop instead of looping.
                    return Err(Error::CommandStatus {
                        status: sync_status::FOLDER_SYNC_REQUIRED,
                        item_id: None,
                    });
                }
                debug!(collection_id, "folder sync required mid-sync");
                on_folder_sync_required(conn)?;
                folder_synced = true;
            }
            RoundOutcome::Failed { status } => {
                warn!(collection_id, status, "sync round refused");
                return Err(Error::CommandStatus {
                    status,
                    item_id: None,
                });
            }
            RoundOutcome::Applied {
                sync_key: new_key,
                more_available,
            } => {
                let new_key = new_key.unwrap_or_else(|| key.clone());
                if more_available && new_key == key {
                    // Same key with more to come: the server is windowing a
                    // large backlog; ask for a bigger window next round.
                    num_windows += 1;
                    trace!(collection_id, num_windows, "growing sync window");
                } else {
                    num_windows = 1;
                }
                key = new_key;
                if !more_available {
                    return Ok(SyncOutcome { sync_key: key, rounds });
                }
            }
        }
    }
}

struct SyncOp<'a, C: SyncCollection> {
    collection: &'a mut C,
    collection_id: &'a str,
    sync_key: &'a str,
    initial_sync: bool,
    num_windows: u32,
}

impl<C: SyncCollection> Operation for SyncOp<'_, C> {
    type Output = RoundOutcome;

    fn command(&self) -> &'static str {
        "Sync"
    }

    fn timeout(&self) -> Duration {
        if self.initial_sync {
            INITIAL_SYNC_TIMEOUT
        } else {
            COMMAND_TIMEOUT
        }
    }

    fn request_body(&mut self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::SYNC_SYNC)?
            .start(tags::SYNC_COLLECTIONS)?
            .start(tags::SYNC_COLLECTION)?;
        if version < ProtocolVersion::V12_1 {
            s.data(tags::SYNC_CLASS, self.collection.class_name())?;
        }
        s.data(tags::SYNC_SYNC_KEY, self.sync_key)?
            .data(tags::SYNC_COLLECTION_ID, self.collection_id)?;
        self.collection
            .write_request(&mut s, version, self.initial_sync, self.num_windows)?;
        s.end()?.end()?.end()?.done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        _version: ProtocolVersion,
    ) -> Result<RoundOutcome> {
        if response.is_empty() {
            return Ok(RoundOutcome::NoChanges);
        }
        match parse_envelope(&response.body, self.collection, self.collection_id) {
            Err(Error::EmptyStream) => Ok(RoundOutcome::NoChanges),
            other => other,
        }
    }
}

/// Parses the `<Sync>` envelope shared by every collection type, delegating
/// `<Commands>` and `<Responses>` to the collection.
fn parse_envelope<C: SyncCollection>(
    body: &[u8],
    collection: &mut C,
    collection_id: &str,
) -> Result<RoundOutcome> {
    let mut p = Parser::new(body)?;
    p.expect_document_start(tags::SYNC_SYNC)?;

    let mut sync_key = None;
    let mut more_available = false;

    while let Token::Start(tag) = p.next_tag(tags::SYNC_SYNC)? {
        match tag {
            tags::SYNC_STATUS => {
                let status = p.value_int()?;
                if status != sync_status::SUCCESS {
                    return Ok(classify_failure(status));
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
                            tags::SYNC_SYNC_KEY => sync_key = Some(p.value()?),
                            tags::SYNC_COLLECTION_ID => {
                                let id = p.value()?;
                                if id != collection_id {
                                    warn!(
                                        expected = collection_id,
                                        got = %id,
                                        "response for a different collection"
                                    );
                                }
                            }
                            tags::SYNC_STATUS => {
                                let status = p.value_int()?;
                                if status != sync_status::SUCCESS {
                                    return Ok(classify_failure(status));
                                }
                            }
                            tags::SYNC_MORE_AVAILABLE => {
                                more_available = true;
                                p.skip_tag()?;
                            }
                            tags::SYNC_COMMANDS => collection.parse_commands(&mut p)?,
                            tags::SYNC_RESPONSES => collection.parse_responses(&mut p)?,
                            _ => p.skip_tag()?,
                        }
                    }
                }
            }
            _ => p.skip_tag()?,
        }
    }

    collection.commit();
    Ok(RoundOutcome::Applied {
        sync_key,
        more_available,
    })
}

fn classify_failure(status: u32) -> RoundOutcome {
    if status == sync_status::FOLDER_SYNC_REQUIRED {
        RoundOutcome::FolderSyncNeeded
    } else {
        RoundOutcome::Failed { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::mock_transport::MockTransport;

    #[derive(Default)]
    struct FakeCollection {
        windows_seen: Vec<u32>,
        initial_seen: Vec<bool>,
        commits: u32,
        rounds_completed: u32,
        window_limit: Option<u32>,
    }

    impl SyncCollection for FakeCollection {
        fn class_name(&self) -> &'static str {
            "Email"
        }

        fn write_request(
            &mut self,
            _s: &mut Serializer<Vec<u8>>,
            _version: ProtocolVersion,
            initial_sync: bool,
            num_windows: u32,
        ) -> Result<()> {
            if let Some(limit) = self.window_limit {
                if num_windows > limit {
                    return Err(Error::SyncWindowExhausted);
                }
            }
            self.windows_seen.push(num_windows);
            self.initial_seen.push(initial_sync);
            Ok(())
        }

        fn parse_commands(&mut self, parser: &mut Parser<&[u8]>) -> Result<()> {
            while let Token::Start(_) = parser.next_tag(tags::SYNC_COMMANDS)? {
                parser.skip_tag()?;
            }
            Ok(())
        }

        fn parse_responses(&mut self, parser: &mut Parser<&[u8]>) -> Result<()> {
            while let Token::Start(_) = parser.next_tag(tags::SYNC_RESPONSES)? {
                parser.skip_tag()?;
            }
            Ok(())
        }

        fn commit(&mut self) {
            self.commits += 1;
        }

        fn round_complete(&mut self) {
            self.rounds_completed += 1;
        }
    }

    fn sync_response(status: u32, sync_key: &str, more: bool) -> Vec<u8> {
        let mut s = Serializer::new(Vec::new()).unwrap();
        s.start(tags::SYNC_SYNC)
            .unwrap()
            .start(tags::SYNC_COLLECTIONS)
            .unwrap()
            .start(tags::SYNC_COLLECTION)
            .unwrap();
        s.data(tags::SYNC_SYNC_KEY, sync_key).unwrap();
        s.data(tags::SYNC_COLLECTION_ID, "5").unwrap();
        s.data(tags::SYNC_STATUS, &status.to_string()).unwrap();
        if more {
            s.tag(tags::SYNC_MORE_AVAILABLE).unwrap();
        }
        s.end().unwrap().end().unwrap().end().unwrap();
        s.done().unwrap();
        s.into_inner()
    }

    fn connection(transport: MockTransport) -> Connection<MockTransport> {
        crate::mock_transport::init_tracing();
        ConnectionBuilder::new("mail.example.org", "user", "pw")
            .device_id("device1")
            .build_with_transport(transport)
    }

    #[test]
    fn single_round_updates_the_key() {
        let transport = MockTransport::new().with_body(sync_response(1, "17", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let outcome = run_sync(&mut conn, &mut collection, "5", "16", |_| {
            panic!("no folder sync expected")
        })
        .unwrap();

        assert_eq!(outcome.sync_key, "17");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(collection.windows_seen, vec![1]);
        assert_eq!(collection.initial_seen, vec![false]);
        assert_eq!(collection.commits, 1);
        assert_eq!(collection.rounds_completed, 1);
    }

    #[test]
    fn empty_sync_key_is_treated_as_initial() {
        let transport = MockTransport::new().with_body(sync_response(1, "1", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let outcome = run_sync(&mut conn, &mut collection, "5", "", |_| {
            panic!("no folder sync expected")
        })
        .unwrap();

        assert_eq!(outcome.sync_key, "1");
        assert_eq!(collection.initial_seen, vec![true]);
    }

    #[test]
    fn window_grows_only_while_the_key_stands_still() {
        // Initial key "0" moves to "5" (reset), then "5" repeats twice with
        // more data (grow), then moves to "6" (reset), then finishes.
        let transport = MockTransport::new()
            .with_body(sync_response(1, "5", true))
            .with_body(sync_response(1, "5", true))
            .with_body(sync_response(1, "5", true))
            .with_body(sync_response(1, "6", true))
            .with_body(sync_response(1, "7", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let outcome = run_sync(&mut conn, &mut collection, "5", "0", |_| {
            panic!("no folder sync expected")
        })
        .unwrap();

        assert_eq!(outcome.sync_key, "7");
        assert_eq!(outcome.rounds, 5);
        assert_eq!(collection.windows_seen, vec![1, 1, 2, 3, 1]);
    }

    #[test]
    fn stalled_server_exhausts_the_window() {
        let mut transport = MockTransport::new();
        for _ in 0..4 {
            transport = transport.with_body(sync_response(1, "5", true));
        }
        let mut conn = connection(transport);
        let mut collection = FakeCollection {
            window_limit: Some(3),
            ..FakeCollection::default()
        };

        let err = run_sync(&mut conn, &mut collection, "5", "5", |_| {
            panic!("no folder sync expected")
        })
        .unwrap_err();
        assert!(matches!(err, Error::SyncWindowExhausted));
        assert_eq!(collection.windows_seen, vec![1, 2, 3]);
    }

    #[test]
    fn empty_body_means_no_changes() {
        let transport = MockTransport::new().with_body(Vec::new());
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let outcome = run_sync(&mut conn, &mut collection, "5", "16", |_| {
            panic!("no folder sync expected")
        })
        .unwrap();

        assert_eq!(outcome.sync_key, "16");
        assert_eq!(collection.commits, 0);
    }

    #[test]
    fn folder_sync_demand_triggers_callback_and_retries() {
        let transport = MockTransport::new()
            .with_body(sync_response(12, "x", false))
            .with_body(sync_response(1, "17", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();
        let mut folder_syncs = 0;

        let outcome = run_sync(&mut conn, &mut collection, "5", "16", |_| {
            folder_syncs += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(folder_syncs, 1);
        assert_eq!(outcome.sync_key, "17");
    }

    #[test]
    fn repeated_folder_sync_demands_give_up() {
        let transport = MockTransport::new()
            .with_body(sync_response(12, "x", false))
            .with_body(sync_response(12, "x", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let err = run_sync(&mut conn, &mut collection, "5", "16", |_| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CommandStatus { status: 12, .. }
        ));
    }

    #[test]
    fn bad_sync_key_is_surfaced_to_the_caller() {
        let transport = MockTransport::new().with_body(sync_response(3, "x", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        let err = run_sync(&mut conn, &mut collection, "5", "16", |_| {
            panic!("no folder sync expected")
        })
        .unwrap_err();
        assert!(matches!(err, Error::CommandStatus { status: 3, .. }));
    }

    #[test]
    fn class_is_sent_only_on_old_dialects() {
        let transport = MockTransport::new()
            .with_body(sync_response(1, "17", false))
            .with_body(sync_response(1, "18", false));
        let mut conn = connection(transport);
        let mut collection = FakeCollection::default();

        run_sync(&mut conn, &mut collection, "5", "16", |_| Ok(())).unwrap();
        conn.set_protocol_version(ProtocolVersion::V2_5);
        run_sync(&mut conn, &mut collection, "5", "17", |_| Ok(())).unwrap();

        let requests = conn.transport().requests();
        let class_bytes = b"Email";
        let contains = |body: &[u8]| body.windows(class_bytes.len()).any(|w| w == class_bytes);
        assert!(!contains(&requests[0].body));
        // On 2.5 the class name travels as an inline string in the request.
        assert!(contains(&requests[1].body));
    }
}

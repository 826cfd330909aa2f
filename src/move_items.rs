//! The MoveItems command: relocating messages between folders.
//!
//! Moves go out one request per message. A server answering a multi-item
//! MoveItems is allowed to reorder or drop responses, and partial results
//! are painful to reconcile; one at a time keeps the bookkeeping exact at
//! the cost of a round trip per message.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::connection::{Connection, HttpResponse, Transport};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::ProtocolVersion;
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// A request to move one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMove {
    pub server_id: String,
    pub source_folder_id: String,
    pub destination_folder_id: String,
}

/// What the caller should do with its local, already-applied move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveDisposition {
    /// The server moved the message; make the local move permanent.
    Success,
    /// A transient refusal; try the move again later.
    Retry,
    /// The server will never perform this move; put the message back.
    Revert,
}

/// Outcome of a [`move_items`] batch.
#[derive(Debug, Default)]
pub struct MoveResults {
    /// Per message, in request order, keyed by the source server id.
    pub dispositions: Vec<(String, MoveDisposition)>,
    /// The id each successfully moved message got in its new folder, when
    /// the server assigned a new one.
    pub new_server_ids: HashMap<String, String>,
    /// The error that cut the batch short, if any. Messages after the
    /// failure are marked [`MoveDisposition::Retry`].
    pub failure: Option<Error>,
}

/// Moves a batch of messages, one request each.
///
/// The batch never fails as a whole: a transport or server error stops
/// sending and marks the unattempted remainder retryable, with the error
/// preserved in [`MoveResults::failure`].
pub fn move_items<T: Transport>(conn: &mut Connection<T>, moves: &[MessageMove]) -> MoveResults {
    let mut results = MoveResults::default();

    for (index, mv) in moves.iter().enumerate() {
        let mut op = MoveOp { mv };
        match conn.run(&mut op) {
            Ok(MoveResponse {
                disposition,
                new_server_id,
            }) => {
                debug!(server_id = %mv.server_id, ?disposition, "move answered");
                if let Some(new_id) = new_server_id {
                    results.new_server_ids.insert(mv.server_id.clone(), new_id);
                }
                results.dispositions.push((mv.server_id.clone(), disposition));
            }
            Err(e) => {
                warn!(server_id = %mv.server_id, error = %e, "move batch cut short");
                for remaining in &moves[index..] {
                    results
                        .dispositions
                        .push((remaining.server_id.clone(), MoveDisposition::Retry));
                }
                results.failure = Some(e);
                break;
            }
        }
    }
    results
}

struct MoveResponse {
    disposition: MoveDisposition,
    new_server_id: Option<String>,
}

struct MoveOp<'a> {
    mv: &'a MessageMove,
}

impl Operation for MoveOp<'_> {
    type Output = MoveResponse;

    fn command(&self) -> &'static str {
        "MoveItems"
    }

    fn request_body(&mut self, _version: ProtocolVersion) -> Result<Vec<u8>> {
        let mut s = Serializer::new(Vec::new())?;
        s.start(tags::MOVE_MOVE_ITEMS)?
            .start(tags::MOVE_MOVE)?
            .data(tags::MOVE_SRC_MSG_ID, &self.mv.server_id)?
            .data(tags::MOVE_SRC_FLD_ID, &self.mv.source_folder_id)?
            .data(tags::MOVE_DST_FLD_ID, &self.mv.destination_folder_id)?
            .end()?
            .end()?
            .done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        _version: ProtocolVersion,
    ) -> Result<MoveResponse> {
        if response.is_empty() {
            // No verdict either way; assume the server never processed it.
            return Ok(MoveResponse {
                disposition: MoveDisposition::Retry,
                new_server_id: None,
            });
        }

        let mut p = Parser::new(&response.body[..])?;
        p.expect_document_start(tags::MOVE_MOVE_ITEMS)?;

        let mut status = None;
        let mut new_server_id = None;

        while let Token::Start(tag) = p.next_tag(tags::MOVE_MOVE_ITEMS)? {
            if tag != tags::MOVE_RESPONSE {
                p.skip_tag()?;
                continue;
            }
            while let Token::Start(tag) = p.next_tag(tags::MOVE_RESPONSE)? {
                match tag {
                    tags::MOVE_STATUS => status = Some(p.value_int()?),
                    tags::MOVE_DST_MSG_ID => new_server_id = Some(p.value()?),
                    tags::MOVE_SRC_MSG_ID => {
                        let id = p.value()?;
                        if id != self.mv.server_id {
                            warn!(expected = %self.mv.server_id, got = %id,
                                "move response for a different message");
                        }
                    }
                    _ => p.skip_tag()?,
                }
            }
        }

        let disposition = match status {
            Some(3) | Some(4) | Some(6) => MoveDisposition::Success,
            Some(7) => MoveDisposition::Retry,
            Some(other) => {
                warn!(status = other, server_id = %self.mv.server_id, "move refused");
                MoveDisposition::Revert
            }
            None => MoveDisposition::Retry,
        };
        Ok(MoveResponse {
            disposition,
            new_server_id: new_server_id.filter(|_| disposition == MoveDisposition::Success),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::mock_transport::MockTransport;
    use std::io;

    fn connection(transport: MockTransport) -> Connection<MockTransport> {
        crate::mock_transport::init_tracing();
        ConnectionBuilder::new("mail.example.org", "user", "pw")
            .device_id("device1")
            .build_with_transport(transport)
    }

    fn mv(server_id: &str) -> MessageMove {
        MessageMove {
            server_id: server_id.to_string(),
            source_folder_id: "src".to_string(),
            destination_folder_id: "dst".to_string(),
        }
    }

    fn move_response(src: &str, status: u32, dst: Option<&str>) -> Vec<u8> {
        let mut s = Serializer::new(Vec::new()).unwrap();
        s.start(tags::MOVE_MOVE_ITEMS)
            .unwrap()
            .start(tags::MOVE_RESPONSE)
            .unwrap();
        s.data(tags::MOVE_SRC_MSG_ID, src).unwrap();
        s.data(tags::MOVE_STATUS, &status.to_string()).unwrap();
        if let Some(dst) = dst {
            s.data(tags::MOVE_DST_MSG_ID, dst).unwrap();
        }
        s.end().unwrap().end().unwrap();
        s.done().unwrap();
        s.into_inner()
    }

    #[test]
    fn successful_move_reports_the_new_id() {
        let transport =
            MockTransport::new().with_body(move_response("1:5", 3, Some("2:9")));
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5")]);

        assert!(results.failure.is_none());
        assert_eq!(
            results.dispositions,
            vec![("1:5".to_string(), MoveDisposition::Success)]
        );
        assert_eq!(results.new_server_ids.get("1:5").map(String::as_str), Some("2:9"));
    }

    #[test]
    fn each_message_gets_its_own_request() {
        let transport = MockTransport::new()
            .with_body(move_response("1:5", 3, None))
            .with_body(move_response("1:6", 3, None));
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5"), mv("1:6")]);

        assert_eq!(results.dispositions.len(), 2);
        assert_eq!(conn.transport().requests().len(), 2);
    }

    #[test]
    fn locked_item_is_retried_and_bad_folder_reverted() {
        let transport = MockTransport::new()
            .with_body(move_response("1:5", 7, None))
            .with_body(move_response("1:6", 1, None));
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5"), mv("1:6")]);

        assert_eq!(
            results.dispositions,
            vec![
                ("1:5".to_string(), MoveDisposition::Retry),
                ("1:6".to_string(), MoveDisposition::Revert),
            ]
        );
    }

    #[test]
    fn empty_response_means_retry() {
        let transport = MockTransport::new().with_body(Vec::new());
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5")]);

        assert_eq!(
            results.dispositions,
            vec![("1:5".to_string(), MoveDisposition::Retry)]
        );
    }

    #[test]
    fn transport_failure_marks_the_rest_retryable() {
        let transport = MockTransport::new()
            .with_body(move_response("1:5", 3, None))
            .with_io_error(io::ErrorKind::ConnectionReset);
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5"), mv("1:6"), mv("1:7")]);

        assert_eq!(
            results.dispositions,
            vec![
                ("1:5".to_string(), MoveDisposition::Success),
                ("1:6".to_string(), MoveDisposition::Retry),
                ("1:7".to_string(), MoveDisposition::Retry),
            ]
        );
        assert!(matches!(results.failure, Some(Error::Io(_))));
        // Only two requests went out.
        assert_eq!(conn.transport().requests().len(), 2);
    }

    #[test]
    fn new_id_is_ignored_when_the_move_failed() {
        let transport =
            MockTransport::new().with_body(move_response("1:5", 1, Some("2:9")));
        let mut conn = connection(transport);

        let results = move_items(&mut conn, &[mv("1:5")]);
        assert!(results.new_server_ids.is_empty());
    }
}

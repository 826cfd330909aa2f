//! Sending mail: the SendMail, SmartReply, and SmartForward commands.
//!
//! Servers speaking 14.0 or later take a ComposeMail WBXML document with
//! the MIME source as an opaque block. Older servers take the raw RFC 822
//! bytes as the whole request body, with the send options expressed as URL
//! parameters instead.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::connection::{Connection, HttpResponse, Transport};
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::protocol::{status_needs_provisioning, ProtocolVersion, RFC822_MIME_TYPE};
use crate::tags;
use crate::wbxml::{Parser, Serializer, Token};

/// A message ready to go out, already rendered to MIME.
#[derive(Clone, Debug)]
pub struct OutgoingMessage<'a> {
    pub mime: &'a [u8],
    /// Ask the server to file a copy in Sent Items.
    pub save_in_sent: bool,
}

/// The server-side message a smart send builds on. The server appends or
/// quotes the original itself, so the upload stays small.
#[derive(Clone, Debug)]
pub struct SourceMessage {
    pub folder_id: String,
    pub server_id: String,
}

/// Sends a new message.
pub fn send_mail<T: Transport>(
    conn: &mut Connection<T>,
    message: &OutgoingMessage<'_>,
) -> Result<()> {
    let mut op = SendOp {
        command: "SendMail",
        compose_tag: tags::COMPOSE_SEND_MAIL,
        message,
        source: None,
        client_id: generate_client_id(),
    };
    conn.run(&mut op)
}

/// Sends a reply to `source`, letting the server attach the quoted original.
pub fn smart_reply<T: Transport>(
    conn: &mut Connection<T>,
    message: &OutgoingMessage<'_>,
    source: &SourceMessage,
) -> Result<()> {
    let mut op = SendOp {
        command: "SmartReply",
        compose_tag: tags::COMPOSE_SMART_REPLY,
        message,
        source: Some(source),
        client_id: generate_client_id(),
    };
    conn.run(&mut op)
}

/// Forwards `source`, letting the server carry the original content and
/// attachments.
pub fn smart_forward<T: Transport>(
    conn: &mut Connection<T>,
    message: &OutgoingMessage<'_>,
    source: &SourceMessage,
) -> Result<()> {
    let mut op = SendOp {
        command: "SmartForward",
        compose_tag: tags::COMPOSE_SMART_FORWARD,
        message,
        source: Some(source),
        client_id: generate_client_id(),
    };
    conn.run(&mut op)
}

/// ClientId lets the server de-duplicate a retried send. EAS 14 caps it at
/// 40 characters.
fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("Send{:x}{:x}", nanos, std::process::id())
}

struct SendOp<'a> {
    command: &'static str,
    compose_tag: tags::Tag,
    message: &'a OutgoingMessage<'a>,
    source: Option<&'a SourceMessage>,
    client_id: String,
}

impl Operation for SendOp<'_> {
    type Output = ();

    fn command(&self) -> &'static str {
        self.command
    }

    fn url_suffix(&self, version: ProtocolVersion) -> Option<String> {
        if version >= ProtocolVersion::V14_0 {
            return None;
        }
        // Everything the ComposeMail document would carry goes into the URL
        // on old dialects.
        let mut suffix = String::new();
        if let Some(source) = self.source {
            suffix.push_str("&ItemId=");
            suffix.push_str(&urlencoding::encode(&source.server_id));
            suffix.push_str("&CollectionId=");
            suffix.push_str(&urlencoding::encode(&source.folder_id));
        }
        if self.message.save_in_sent {
            suffix.push_str("&SaveInSent=T");
        }
        if suffix.is_empty() {
            None
        } else {
            Some(suffix)
        }
    }

    fn content_type(&self, version: ProtocolVersion) -> &'static str {
        if version >= ProtocolVersion::V14_0 {
            crate::protocol::WBXML_MIME_TYPE
        } else {
            RFC822_MIME_TYPE
        }
    }

    fn request_body(&mut self, version: ProtocolVersion) -> Result<Vec<u8>> {
        if version < ProtocolVersion::V14_0 {
            return Ok(self.message.mime.to_vec());
        }

        let mut s = Serializer::new(Vec::new())?;
        s.start(self.compose_tag)?
            .data(tags::COMPOSE_CLIENT_ID, &self.client_id)?;
        if let Some(source) = self.source {
            s.start(tags::COMPOSE_SOURCE)?
                .data(tags::COMPOSE_FOLDER_ID, &source.folder_id)?
                .data(tags::COMPOSE_ITEM_ID, &source.server_id)?
                .end()?;
        }
        if self.message.save_in_sent {
            s.tag(tags::COMPOSE_SAVE_IN_SENT_ITEMS)?;
        }
        let mut mime = self.message.mime;
        let len = mime.len();
        s.start(tags::COMPOSE_MIME)?
            .opaque(&mut mime, len)?
            .end()?;
        s.end()?.done()?;
        Ok(s.into_inner())
    }

    fn handle_response(
        &mut self,
        response: HttpResponse,
        version: ProtocolVersion,
    ) -> Result<()> {
        if version < ProtocolVersion::V14_0 {
            // Old dialects answer a successful send with whatever they
            // please; only the HTTP status counts.
            return Ok(());
        }
        if response.is_empty() {
            // The usual success shape.
            debug!(command = self.command, "message accepted");
            return Ok(());
        }

        let mut p = match Parser::new(&response.body[..]) {
            Err(Error::EmptyStream) => return Ok(()),
            other => other?,
        };
        p.expect_document_start(self.compose_tag)?;

        let mut status = None;
        while let Token::Start(tag) = p.next_tag(self.compose_tag)? {
            match tag {
                tags::COMPOSE_STATUS => status = Some(p.value_int()?),
                _ => p.skip_tag()?,
            }
        }

        match status {
            None | Some(1) => Ok(()),
            Some(status) if status_needs_provisioning(status) => {
                warn!(command = self.command, status, "send needs provisioning");
                Err(Error::ProvisioningRequired)
            }
            Some(status) => {
                warn!(command = self.command, status, "send refused");
                Err(Error::CommandStatus {
                    status,
                    item_id: None,
                })
            }
        }
    }
}

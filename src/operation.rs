//! The shared request/response lifecycle every command goes through.
//!
//! A command implements [`Operation`] (build a request body, interpret a 200
//! response); [`Connection::run`] supplies everything common: URL and header
//! construction, the POST itself, and classification of the HTTP statuses
//! that mean the same thing for every command.

use std::io;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::{Connection, HttpResponse, Transport, COMMAND_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{ProtocolVersion, WBXML_MIME_TYPE};

/// One Exchange ActiveSync command.
pub trait Operation {
    /// What the command's parsed response is turned into.
    type Output;

    /// The `Cmd=` value in the request URL.
    fn command(&self) -> &'static str;

    /// Extra query parameters appended verbatim to the URL, e.g.
    /// `&SaveInSent=T`.
    fn url_suffix(&self, _version: ProtocolVersion) -> Option<String> {
        None
    }

    /// Builds the request body.
    fn request_body(&mut self, version: ProtocolVersion) -> Result<Vec<u8>>;

    fn content_type(&self, _version: ProtocolVersion) -> &'static str {
        WBXML_MIME_TYPE
    }

    fn timeout(&self) -> Duration {
        COMMAND_TIMEOUT
    }

    /// Whether the current policy key accompanies the request. Provisioning
    /// itself must not send a stale key.
    fn uses_policy_key(&self) -> bool {
        true
    }

    /// Some commands (FolderSync) see HTTP 403 from servers that actually
    /// want a provisioning round rather than denying access outright.
    fn forbidden_means_provisioning(&self) -> bool {
        false
    }

    /// Interprets a 200 response.
    fn handle_response(
        &mut self,
        response: HttpResponse,
        version: ProtocolVersion,
    ) -> Result<Self::Output>;
}

impl<T: Transport> Connection<T> {
    /// Runs one operation to completion, classifying the HTTP statuses all
    /// commands share.
    pub fn run<O: Operation>(&mut self, op: &mut O) -> Result<O::Output> {
        let mut rehomed = false;
        loop {
            let version = self.protocol_version();
            let body = op.request_body(version)?;
            let response = self.send(
                op.command(),
                op.url_suffix(version).as_deref(),
                op.content_type(version),
                body,
                op.timeout(),
                op.uses_policy_key(),
            )?;
            match response.status {
                200 => return op.handle_response(response, version),
                401 => return Err(Error::AuthenticationFailed),
                403 if op.forbidden_means_provisioning() => {
                    return Err(Error::ProvisioningRequired)
                }
                403 => return Err(Error::AccessDenied),
                449 => return Err(Error::ProvisioningRequired),
                451 => {
                    // The mailbox moved servers. Rehome once and retry; a
                    // second 451 in a row means the server is confused.
                    if rehomed {
                        return Err(Error::TooManyRedirects);
                    }
                    let location = response
                        .header("X-MS-Location")
                        .ok_or_else(|| {
                            Error::MalformedProtocol(
                                "451 response without an X-MS-Location header".into(),
                            )
                        })?
                        .to_string();
                    debug!(command = op.command(), %location, "server moved, retrying");
                    self.redirect_to(&location);
                    rehomed = true;
                }
                status => {
                    warn!(command = op.command(), status, "unexpected http status");
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("unexpected http status {}", status),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::mock_transport::MockTransport;

    struct Probe {
        responses_seen: usize,
    }

    impl Operation for Probe {
        type Output = u16;

        fn command(&self) -> &'static str {
            "Probe"
        }

        fn request_body(&mut self, _version: ProtocolVersion) -> Result<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }

        fn handle_response(
            &mut self,
            response: HttpResponse,
            _version: ProtocolVersion,
        ) -> Result<u16> {
            self.responses_seen += 1;
            Ok(response.status)
        }
    }

    fn connection(transport: MockTransport) -> crate::connection::Connection<MockTransport> {
        crate::mock_transport::init_tracing();
        ConnectionBuilder::new("mail.example.org", "user", "pw")
            .device_id("device1")
            .build_with_transport(transport)
    }

    #[test]
    fn success_reaches_handle_response() {
        let mut conn = connection(MockTransport::new().with_status(200));
        let mut op = Probe { responses_seen: 0 };
        assert_eq!(conn.run(&mut op).unwrap(), 200);
        assert_eq!(op.responses_seen, 1);
    }

    #[test]
    fn auth_and_provisioning_statuses_classify() {
        for (status, check) in [
            (401, Error::AuthenticationFailed),
            (403, Error::AccessDenied),
            (449, Error::ProvisioningRequired),
        ] {
            let mut conn = connection(MockTransport::new().with_status(status));
            let mut op = Probe { responses_seen: 0 };
            let err = conn.run(&mut op).unwrap_err();
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&check),
                "status {}",
                status
            );
            assert_eq!(op.responses_seen, 0);
        }
    }

    #[test]
    fn rehomes_once_on_451_and_retries() {
        let transport = MockTransport::new()
            .with_header_response(451, &[("X-MS-Location", "https://eu.example.org/x")])
            .with_status(200);
        let mut conn = connection(transport);
        let mut op = Probe { responses_seen: 0 };

        assert_eq!(conn.run(&mut op).unwrap(), 200);
        let requests = conn_requests(&conn);
        assert_eq!(requests.len(), 2);
        assert!(requests[1].url.starts_with("https://eu.example.org/"));
    }

    #[test]
    fn repeated_451_gives_up() {
        let transport = MockTransport::new()
            .with_header_response(451, &[("X-MS-Location", "https://a.example.org/x")])
            .with_header_response(451, &[("X-MS-Location", "https://b.example.org/x")]);
        let mut conn = connection(transport);
        let mut op = Probe { responses_seen: 0 };

        let err = conn.run(&mut op).unwrap_err();
        assert!(matches!(err, Error::TooManyRedirects));
    }

    fn conn_requests(
        conn: &crate::connection::Connection<MockTransport>,
    ) -> Vec<crate::connection::HttpRequest> {
        conn.transport().requests()
    }
}

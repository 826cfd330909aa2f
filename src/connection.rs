//! The per-account session context: credentials, server location, protocol
//! version, policy key, and the HTTP plumbing every command goes through.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{ProtocolVersion, DEVICE_TYPE};

/// Time allowed for establishing a connection.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// Time allowed for an ordinary command round-trip.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Time allowed for an initial sync, which can be much larger than an
/// incremental one.
pub(crate) const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// How many HTTP redirects we follow for a single request before giving up.
const MAX_REDIRECTS: u32 = 5;

/// An HTTP POST about to be sent to the server.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub url: String,
    /// Header name/value pairs, including `Content-Type`.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// A fully-read HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Looks up a header value, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// The seam between the protocol layer and the actual HTTP stack, so
/// operations and sync loops can be exercised against a scripted transport.
pub trait Transport {
    /// Sends one POST and reads the whole response. Redirects must not be
    /// followed here; the connection follows them itself so the count can be
    /// bounded.
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// The production [`Transport`], backed by a blocking `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> UreqTransport {
        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        UreqTransport { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut req = self.agent.post(&request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            req = req.set(name, value);
        }
        let response = match req.send_bytes(&request.body) {
            Ok(response) => response,
            // Non-2xx statuses carry protocol meaning here (449, 451, ...);
            // surface them as responses, not errors.
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(t)) => return Err(t.into()),
        };
        let status = response.status();
        let headers = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                response
                    .header(&name)
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Why an in-progress operation was asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The caller no longer wants the result at all.
    Abort,
    /// The caller wants the operation re-run from scratch (for example after
    /// settings changed).
    Restart,
}

#[derive(Default)]
struct StopState {
    stopped: AtomicBool,
    // 0 = none, 1 = abort, 2 = restart
    reason: AtomicU8,
}

/// A cloneable handle that can interrupt a [`Connection`]'s next (or
/// currently blocking) request from another thread.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<StopState>,
}

impl StopHandle {
    pub fn stop(&self, reason: StopReason) {
        let code = match reason {
            StopReason::Abort => 1,
            StopReason::Restart => 2,
        };
        self.state.reason.store(code, Ordering::SeqCst);
        self.state.stopped.store(true, Ordering::SeqCst);
    }
}

/// A session with one Exchange ActiveSync server on behalf of one account.
///
/// Holds everything requests need: endpoint, credentials, the negotiated
/// protocol version, the provisioning policy key, and the device identity.
/// Commands run through [`Connection::run`](crate::operation) or the
/// higher-level functions in [`sync`](crate::sync) and friends.
pub struct Connection<T: Transport> {
    transport: T,
    host: String,
    use_tls: bool,
    username: String,
    password: String,
    device_id: String,
    user_agent: String,
    protocol_version: ProtocolVersion,
    policy_key: Option<String>,
    stop: Arc<StopState>,
}

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    host: String,
    use_tls: bool,
    username: String,
    password: String,
    device_id: Option<String>,
    user_agent: Option<String>,
    protocol_version: ProtocolVersion,
    policy_key: Option<String>,
}

impl ConnectionBuilder {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            host: host.into(),
            use_tls: true,
            username: username.into(),
            password: password.into(),
            device_id: None,
            user_agent: None,
            protocol_version: ProtocolVersion::DEFAULT,
            policy_key: None,
        }
    }

    /// Allows plain HTTP. Only sensible against test servers.
    pub fn danger_plaintext(mut self) -> Self {
        self.use_tls = false;
        self
    }

    /// Sets the stable device identifier reported to the server. Servers
    /// track state per device id, so callers should persist one per account
    /// and always pass it back; without this a fresh id is generated.
    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.device_id = Some(id.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Seeds the policy key from a previous provisioning round.
    pub fn policy_key(mut self, key: impl Into<String>) -> Self {
        self.policy_key = Some(key.into());
        self
    }

    pub fn build(self) -> Connection<UreqTransport> {
        self.build_with_transport(UreqTransport::new())
    }

    pub fn build_with_transport<T: Transport>(self, transport: T) -> Connection<T> {
        let device_id = self.device_id.unwrap_or_else(generate_device_id);
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| format!("eas-client/{}", env!("CARGO_PKG_VERSION")));
        Connection {
            transport,
            host: self.host,
            use_tls: self.use_tls,
            username: self.username,
            password: self.password,
            device_id,
            user_agent,
            protocol_version: self.protocol_version,
            policy_key: self.policy_key,
            stop: Arc::new(StopState::default()),
        }
    }
}

fn generate_device_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("androidc{:x}", nanos ^ u128::from(std::process::id()))
}

impl<T: Transport> Connection<T> {
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn policy_key(&self) -> Option<&str> {
        self.policy_key.as_deref()
    }

    /// Installs (or clears) the provisioning policy key sent with requests.
    pub fn set_policy_key(&mut self, key: Option<String>) {
        self.policy_key = key;
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// A handle other threads can use to interrupt this connection.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: Arc::clone(&self.stop),
        }
    }

    /// Why the last request failed with a stop, if it did. A stopped request
    /// fails with the same error shape as a dead connection; this is how
    /// callers tell the two apart.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.stop.reason.load(Ordering::SeqCst) {
            1 => Some(StopReason::Abort),
            2 => Some(StopReason::Restart),
            _ => None,
        }
    }

    /// Sends one command POST, following plain HTTP redirects up to a bound.
    pub(crate) fn send(
        &mut self,
        command: &str,
        url_suffix: Option<&str>,
        content_type: &str,
        body: Vec<u8>,
        timeout: Duration,
        use_policy_key: bool,
    ) -> Result<HttpResponse> {
        if self.stop.stopped.swap(false, Ordering::SeqCst) {
            return Err(stopped_error());
        }
        self.stop.reason.store(0, Ordering::SeqCst);

        let mut url = self.command_url(command, url_suffix);
        let headers = self.headers(content_type, use_policy_key);
        let mut redirects = 0;
        loop {
            let request = HttpRequest {
                url: url.clone(),
                headers: headers.clone(),
                body: body.clone(),
                timeout,
            };
            debug!(command, url = %request.url, bytes = request.body.len(), "sending request");
            let result = self.transport.execute(&request);
            // A stop that raced the request wins regardless of how the
            // request itself came out.
            if self.stop.stopped.swap(false, Ordering::SeqCst) {
                return Err(stopped_error());
            }
            let response = result?;
            match response.status {
                301 | 302 | 307 | 308 => {
                    redirects += 1;
                    if redirects > MAX_REDIRECTS {
                        return Err(Error::TooManyRedirects);
                    }
                    let location = response.header("Location").ok_or_else(|| {
                        Error::MalformedProtocol("redirect without a Location header".into())
                    })?;
                    debug!(%location, "following redirect");
                    url = location.to_string();
                }
                status => {
                    debug!(status, bytes = response.body.len(), "got response");
                    return Ok(response);
                }
            }
        }
    }

    /// Permanently rehomes this session to the host named by a 451 response.
    pub(crate) fn redirect_to(&mut self, location: &str) {
        let without_scheme = location
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(location);
        let host = without_scheme
            .split(['/', '?'])
            .next()
            .unwrap_or(without_scheme);
        if host.is_empty() {
            warn!(%location, "ignoring empty redirect target");
            return;
        }
        debug!(from = %self.host, to = %host, "server moved us");
        self.host = host.to_string();
    }

    fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}/Microsoft-Server-ActiveSync", scheme, self.host)
    }

    pub(crate) fn command_url(&self, command: &str, suffix: Option<&str>) -> String {
        let mut url = format!(
            "{}?Cmd={}&User={}&DeviceId={}&DeviceType={}",
            self.base_url(),
            command,
            urlencoding::encode(&self.username),
            self.device_id,
            DEVICE_TYPE,
        );
        if let Some(suffix) = suffix {
            url.push_str(suffix);
        }
        url
    }

    fn headers(&self, content_type: &str, use_policy_key: bool) -> Vec<(String, String)> {
        let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
        let mut headers = vec![
            ("Authorization".into(), format!("Basic {}", credentials)),
            (
                "MS-ASProtocolVersion".into(),
                self.protocol_version.as_str().into(),
            ),
            ("User-Agent".into(), self.user_agent.clone()),
            ("Content-Type".into(), content_type.into()),
        ];
        if use_policy_key {
            // "0" tells an enforcing server we hold no policy yet, so it can
            // answer 449 instead of failing the command outright.
            let key = self.policy_key.as_deref().unwrap_or("0");
            headers.push(("X-MS-PolicyKey".into(), key.to_string()));
        }
        headers
    }
}

fn stopped_error() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Interrupted,
        "request stopped by caller",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;
    use crate::protocol::WBXML_MIME_TYPE;

    fn connection(transport: MockTransport) -> Connection<MockTransport> {
        crate::mock_transport::init_tracing();
        ConnectionBuilder::new("mail.example.org", "user@example.org", "hunter2")
            .device_id("device1")
            .build_with_transport(transport)
    }

    #[test]
    fn command_url_carries_identity() {
        let conn = connection(MockTransport::new());
        let url = conn.command_url("Sync", None);
        assert_eq!(
            url,
            "https://mail.example.org/Microsoft-Server-ActiveSync\
             ?Cmd=Sync&User=user%40example.org&DeviceId=device1&DeviceType=Android"
        );
    }

    #[test]
    fn command_url_suffix_is_appended_verbatim() {
        let conn = connection(MockTransport::new());
        let url = conn.command_url("SendMail", Some("&SaveInSent=T"));
        assert!(url.ends_with("&DeviceType=Android&SaveInSent=T"));
    }

    #[test]
    fn policy_key_header_is_zero_until_provisioned_and_omitted_when_unwanted() {
        let transport = MockTransport::new()
            .with_status(200)
            .with_status(200)
            .with_status(200);
        let mut conn = connection(transport);

        conn.send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap();
        conn.set_policy_key(Some("12345".into()));
        conn.send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap();
        conn.send("Ping", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, false)
            .unwrap();

        let requests = conn.transport.requests();
        let key_header = |i: usize| {
            requests[i]
                .headers
                .iter()
                .find(|(n, _)| n == "X-MS-PolicyKey")
                .map(|(_, v)| v.clone())
        };
        assert_eq!(key_header(0), Some("0".into()));
        assert_eq!(key_header(1), Some("12345".into()));
        // Provisioning itself never sends a key, not even "0".
        assert_eq!(key_header(2), None);
    }

    #[test]
    fn follows_redirects_up_to_the_cap() {
        let mut transport = MockTransport::new();
        for i in 0..3 {
            transport = transport.with_redirect(302, &format!("https://hop{}.example.org/x", i));
        }
        transport = transport.with_status(200);
        let mut conn = connection(transport);

        let response = conn
            .send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap();
        assert_eq!(response.status, 200);
        let requests = conn.transport.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].url, "https://hop2.example.org/x");
    }

    #[test]
    fn gives_up_after_too_many_redirects() {
        let mut transport = MockTransport::new();
        for i in 0..6 {
            transport = transport.with_redirect(302, &format!("https://hop{}.example.org/x", i));
        }
        let mut conn = connection(transport);

        let err = conn
            .send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap_err();
        assert!(matches!(err, Error::TooManyRedirects));
    }

    #[test]
    fn stop_before_send_fails_fast_and_records_reason() {
        let mut conn = connection(MockTransport::new());
        conn.stop_handle().stop(StopReason::Restart);

        let err = conn
            .send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(conn.stop_reason(), Some(StopReason::Restart));
        // No request reached the wire.
        assert!(conn.transport.requests().is_empty());
    }

    #[test]
    fn stop_during_flight_overrides_the_response() {
        let transport = MockTransport::new().with_status(200);
        let mut conn = connection(transport);
        let handle = conn.stop_handle();
        conn.transport.on_execute(move || handle.stop(StopReason::Abort));

        let err = conn
            .send("Sync", None, WBXML_MIME_TYPE, vec![], COMMAND_TIMEOUT, true)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(conn.stop_reason(), Some(StopReason::Abort));
    }

    #[test]
    fn rehoming_keeps_only_the_host() {
        let mut conn = connection(MockTransport::new());
        conn.redirect_to("https://eu.mail.example.org/Microsoft-Server-ActiveSync?Cmd=Sync");
        assert!(conn
            .command_url("Sync", None)
            .starts_with("https://eu.mail.example.org/Microsoft-Server-ActiveSync"));
    }
}

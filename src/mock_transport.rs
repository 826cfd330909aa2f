//! A scripted [`Transport`] for exercising operations and sync loops
//! without a server. Responses are played back in the order they were
//! queued; running past the end of the script is a test bug and panics.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;

use crate::connection::{HttpRequest, HttpResponse, Transport};
use crate::error::{Error, Result};

/// Routes `tracing` output through the test harness so `RUST_LOG=trace`
/// shows the wire-level tag log of a failing test. First caller wins;
/// repeated calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Scripted {
    Response(HttpResponse),
    IoError(io::ErrorKind),
}

#[derive(Default)]
pub(crate) struct MockTransport {
    script: RefCell<VecDeque<Scripted>>,
    requests: RefCell<Vec<HttpRequest>>,
    on_execute: RefCell<Option<Box<dyn Fn()>>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Queues a response with a status and no body.
    pub fn with_status(self, status: u16) -> Self {
        self.with_response(status, Vec::new())
    }

    /// Queues a 200 response carrying a WBXML body.
    pub fn with_body(self, body: Vec<u8>) -> Self {
        self.with_response(200, body)
    }

    pub fn with_response(self, status: u16, body: Vec<u8>) -> Self {
        self.script.borrow_mut().push_back(Scripted::Response(HttpResponse {
            status,
            headers: Vec::new(),
            body,
        }));
        self
    }

    pub fn with_header_response(self, status: u16, headers: &[(&str, &str)]) -> Self {
        self.script.borrow_mut().push_back(Scripted::Response(HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: Vec::new(),
        }));
        self
    }

    pub fn with_redirect(self, status: u16, location: &str) -> Self {
        self.with_header_response(status, &[("Location", location)])
    }

    /// Queues a transport-level failure.
    pub fn with_io_error(self, kind: io::ErrorKind) -> Self {
        self.script.borrow_mut().push_back(Scripted::IoError(kind));
        self
    }

    /// Runs `hook` on every execute, before the scripted response is
    /// returned. Used to race stops against in-flight requests.
    pub fn on_execute(&self, hook: impl Fn() + 'static) {
        *self.on_execute.borrow_mut() = Some(Box::new(hook));
    }

    /// Every request sent so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.borrow().clone()
    }
}

impl Transport for MockTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(hook) = &*self.on_execute.borrow() {
            hook();
        }
        match self.script.borrow_mut().pop_front() {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::IoError(kind)) => {
                Err(Error::Io(io::Error::new(kind, "scripted failure")))
            }
            None => panic!("mock transport script exhausted by {}", request.url),
        }
    }
}

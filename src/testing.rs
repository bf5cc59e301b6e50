//! In-memory collaborators shared by the unit tests.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::{Body, Method, Request, StatusCode};

use crate::app::{AuthService, PersistenceUnit, Session, ViewRenderer};
use crate::config::RouterConfig;
use crate::error::{RouterError, RouterResult};
use crate::http::Response;
use crate::request::{EvictionSet, Principal, RequestWrapper};
use crate::table::Incoming;

/// A configuration suitable for tests: few workers, short timeouts.
pub fn config() -> RouterConfig {
    RouterConfig {
        max_workers: 4,
        worker_keep_alive_secs: 1,
        phase_timeout_secs: 2,
        pool_capacity: 4,
        ..RouterConfig::default()
    }
}

pub fn incoming(method: Method, uri: &str, secure: bool) -> Incoming {
    incoming_with(Request::builder().method(method).uri(uri), Bytes::new(), secure)
}

pub fn incoming_with(
    builder: hyper::http::request::Builder,
    body: Bytes,
    secure: bool,
) -> Incoming {
    let head = builder.body(()).unwrap().into_parts().0;
    Incoming { head, body, secure }
}

pub async fn body_string(response: Response) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Renders `view status resumed` as plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRenderer;

impl ViewRenderer for EchoRenderer {
    fn render(
        &self,
        view: &str,
        request: &RequestWrapper,
        status: StatusCode,
        resumed: bool,
    ) -> RouterResult<Response> {
        let mut body = format!("{} {} {}", view, status.as_u16(), resumed);
        for (field, message) in request.errors().fields() {
            body.push_str(&format!(" {}={}", field, message));
        }
        hyper::Response::builder()
            .status(status)
            .body(Body::from(body))
            .map_err(RouterError::application)
    }
}

/// An ordered record of collaborator calls, shared between threads.
#[derive(Debug, Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub struct RecordingPersistence {
    journal: Journal,
    fail_commit: bool,
}

impl RecordingPersistence {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail_commit: false,
        }
    }

    /// Sessions whose commit is recorded and then refused.
    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }
}

impl PersistenceUnit for RecordingPersistence {
    fn open(&self) -> RouterResult<Box<dyn Session>> {
        self.journal.push("open");
        Ok(Box::new(RecordingSession {
            journal: self.journal.clone(),
            fail_commit: self.fail_commit,
        }))
    }
}

pub struct RecordingSession {
    journal: Journal,
    fail_commit: bool,
}

impl RecordingSession {
    pub fn write(&mut self, what: &str) {
        self.journal.push(format!("write:{}", what));
    }
}

impl Session for RecordingSession {
    fn begin(&mut self) -> RouterResult<()> {
        self.journal.push("begin");
        Ok(())
    }

    fn commit(&mut self) -> RouterResult<()> {
        self.journal.push("commit");
        if self.fail_commit {
            return Err(RouterError::Persistence("serialization failure".to_owned()));
        }
        Ok(())
    }

    fn rollback(&mut self) -> RouterResult<()> {
        self.journal.push("rollback");
        Ok(())
    }

    fn close(&mut self) {
        self.journal.push("close");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Resolves every secure request to the same principal.
pub struct FixedAuth {
    principal: Option<Principal>,
    journal: Journal,
    delay: Duration,
    fail: bool,
}

impl FixedAuth {
    pub fn new(principal: Option<Principal>, journal: Journal) -> Self {
        Self {
            principal,
            journal,
            delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl AuthService for FixedAuth {
    fn resolve(&self, _request: &RequestWrapper) -> RouterResult<Option<Principal>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail {
            return Err(RouterError::application("credential store unreachable"));
        }
        Ok(self.principal.clone())
    }

    fn evict(&self, evictions: &EvictionSet) -> RouterResult<()> {
        match evictions {
            EvictionSet::Empty => {}
            EvictionSet::All => self.journal.push("evict:all"),
            EvictionSet::Principals(ids) => {
                let mut ids: Vec<_> = ids.iter().collect();
                ids.sort();
                for id in ids {
                    self.journal.push(format!("evict:{}", id));
                }
            }
        }
        Ok(())
    }
}

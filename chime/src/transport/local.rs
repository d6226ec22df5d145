//! Scripted in-process transport for testing.
//!
//! [`LocalTransport`] plays the role of the Chime service: tests queue page
//! responses per endpoint, then drive the client and inspect what was
//! requested, posted, and joined. Message posts are answered with a full
//! server-shaped record, the way the real service echoes back what it
//! stored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{ChimeTransport, TransportError};

#[derive(Default)]
struct Inner {
    pages: HashMap<String, VecDeque<Value>>,
    requests: Vec<(String, Option<String>)>,
    posted: Vec<(String, Value)>,
    joined: Vec<String>,
    fail_next: bool,
    next_created_on: Option<String>,
    profile_id: String,
}

/// In-process transport backed by scripted responses.
pub struct LocalTransport {
    inner: Mutex<Inner>,
}

impl LocalTransport {
    /// Creates a transport whose message posts are attributed to
    /// `profile_id`, matching the authenticated user of a real connection.
    #[must_use]
    pub fn new(profile_id: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                profile_id: profile_id.to_string(),
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic mid-update, so a poisoned lock
        // still holds consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the next page response for `path`. Pages are served in the
    /// order queued, one per `fetch_page` call.
    pub fn queue_page(&self, path: &str, page: Value) {
        self.lock().pages.entry(path.to_string()).or_default().push_back(page);
    }

    /// Makes the next `fetch_page` or `post_message` fail with a timeout.
    pub fn fail_next_request(&self) {
        self.lock().fail_next = true;
    }

    /// Overrides the `CreatedOn` the next message post is echoed with.
    pub fn set_next_created_on(&self, stamp: &str) {
        self.lock().next_created_on = Some(stamp.to_string());
    }

    /// Every `fetch_page` call so far, as `(path, next_token)` pairs.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.lock().requests.clone()
    }

    /// Every body handed to `post_message`, with its path.
    #[must_use]
    pub fn posted(&self) -> Vec<(String, Value)> {
        self.lock().posted.clone()
    }

    /// Channels currently joined, in join order.
    #[must_use]
    pub fn joined_channels(&self) -> Vec<String> {
        self.lock().joined.clone()
    }
}

impl ChimeTransport for LocalTransport {
    async fn fetch_page(
        &self,
        path: &str,
        _max_results: u32,
        next_token: Option<&str>,
    ) -> Result<Value, TransportError> {
        let mut inner = self.lock();
        inner
            .requests
            .push((path.to_string(), next_token.map(str::to_string)));
        if inner.fail_next {
            inner.fail_next = false;
            return Err(TransportError::Timeout);
        }
        inner
            .pages
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| TransportError::Http {
                status: 404,
                reason: format!("no scripted page for {path}"),
            })
    }

    async fn post_message(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        let mut inner = self.lock();
        if inner.fail_next {
            inner.fail_next = false;
            return Err(TransportError::Timeout);
        }
        inner.posted.push((path.to_string(), body.clone()));
        let created_on = inner
            .next_created_on
            .take()
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let content = body.get("Content").and_then(Value::as_str).unwrap_or("");
        Ok(json!({
            "MessageId": Uuid::new_v4().to_string(),
            "Content": content,
            "Sender": inner.profile_id,
            "CreatedOn": created_on,
        }))
    }

    fn join_channel(&self, channel: &str) {
        let mut inner = self.lock();
        if !inner.joined.iter().any(|c| c == channel) {
            inner.joined.push(channel.to_string());
        }
    }

    fn leave_channel(&self, channel: &str) {
        self.lock().joined.retain(|c| c != channel);
    }
}

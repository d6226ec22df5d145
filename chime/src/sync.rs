//! Refresh state machine for entity collections.
//!
//! A [`SyncController`] drives full-list refreshes of one
//! [`EntityCollection`]. It is a pure state machine: callers ask it what to
//! fetch, perform the fetch themselves, and feed the page back. Refresh
//! requests that arrive while a pass is running are coalesced into a single
//! follow-up pass, so any burst of invalidations costs at most one extra
//! sweep of the collection endpoint.
//!
//! State transitions:
//! - `Idle` + refresh request: bump the collection generation, go
//!   `Fetching`, hand out the first page request.
//! - `Fetching` + refresh request: go `Stale`; nothing to fetch yet.
//! - `Stale` + refresh request: already pending, absorbed.
//! - final page while `Stale`: restart from page one under the same pass,
//!   without expiring anything.
//! - final page while `Fetching`: expire everything the pass did not
//!   confirm, go `Idle`.

use tracing::{debug, warn};

use crate::cache::{CachedEntity, EntityCollection};
use crate::transport::TransportError;

/// Where a controller is in its refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No refresh running.
    Idle,
    /// A refresh pass is walking the collection pages.
    Fetching,
    /// A refresh pass is running and another was requested meanwhile.
    Stale,
}

/// One page fetch the caller should perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Endpoint to fetch.
    pub path: &'static str,
    /// Page size to request.
    pub max_results: u32,
    /// Continuation token, absent for the first page.
    pub next_token: Option<String>,
}

/// What to do after a page has been folded in.
#[derive(Debug)]
pub enum PageOutcome<E> {
    /// More pages remain; fetch this one next.
    Next(PageRequest),
    /// The pass went stale and restarted; fetch page one again.
    Restarted(PageRequest),
    /// The refresh finished; these entities vanished from the listing.
    Complete {
        /// Entities removed by the post-pass sweep.
        expired: Vec<E>,
    },
}

/// Errors surfaced by a refresh pass.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The page response did not carry the expected record array.
    #[error("page response is missing the {key} collection")]
    MissingCollection {
        /// The array member that was absent.
        key: &'static str,
    },

    /// The page fetch itself failed.
    #[error(transparent)]
    Network(#[from] TransportError),
}

/// Coalescing refresh driver for one entity collection.
pub struct SyncController {
    state: SyncState,
    max_results: u32,
}

impl SyncController {
    /// Creates an idle controller requesting pages of `max_results`.
    #[must_use]
    pub const fn new(max_results: u32) -> Self {
        Self {
            state: SyncState::Idle,
            max_results,
        }
    }

    /// Current refresh state.
    #[must_use]
    pub const fn state(&self) -> SyncState {
        self.state
    }

    /// Asks for a refresh of `coll`.
    ///
    /// Returns the first page request when this starts a new pass, or
    /// `None` when a running pass absorbed the request.
    pub fn request_refresh<E: CachedEntity>(
        &mut self,
        coll: &mut EntityCollection<E>,
    ) -> Option<PageRequest> {
        match self.state {
            SyncState::Idle => {
                coll.bump_generation();
                self.state = SyncState::Fetching;
                debug!(kind = E::KIND, "starting refresh pass");
                Some(self.first_page::<E>())
            }
            SyncState::Fetching => {
                self.state = SyncState::Stale;
                debug!(kind = E::KIND, "refresh already running, marking stale");
                None
            }
            SyncState::Stale => None,
        }
    }

    /// Folds one fetched page into `coll` and reports what to do next.
    ///
    /// Individual malformed records are logged and skipped; they do not
    /// abort the pass.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingCollection`] when the response lacks the
    /// record array entirely.
    pub fn handle_page<E: CachedEntity>(
        &mut self,
        coll: &mut EntityCollection<E>,
        page: &serde_json::Value,
    ) -> Result<PageOutcome<E>, SyncError> {
        let records = page
            .get(E::ARRAY_KEY)
            .and_then(serde_json::Value::as_array)
            .ok_or(SyncError::MissingCollection { key: E::ARRAY_KEY })?;

        for record in records {
            if let Err(err) = coll.upsert(record) {
                warn!(kind = E::KIND, error = %err, "skipping malformed record in refresh page");
            }
        }

        if let Some(token) = page.get("NextToken").and_then(serde_json::Value::as_str) {
            return Ok(PageOutcome::Next(PageRequest {
                path: E::LIST_PATH,
                max_results: self.max_results,
                next_token: Some(token.to_string()),
            }));
        }

        if self.state == SyncState::Stale {
            // A refresh was requested mid-pass. Restart from page one under
            // a fresh generation; nothing gets expired until a pass runs to
            // completion without going stale.
            coll.bump_generation();
            self.state = SyncState::Fetching;
            debug!(kind = E::KIND, "stale pass complete, restarting refresh");
            return Ok(PageOutcome::Restarted(self.first_page::<E>()));
        }

        self.state = SyncState::Idle;
        let expired = coll.expire_outdated();
        debug!(kind = E::KIND, expired = expired.len(), "refresh pass complete");
        Ok(PageOutcome::Complete { expired })
    }

    /// Abandons the running pass, e.g. after a transport failure. No sweep
    /// happens; entities the aborted pass did not confirm survive until a
    /// later pass completes.
    pub fn abort(&mut self) {
        self.state = SyncState::Idle;
    }

    fn first_page<E: CachedEntity>(&self) -> PageRequest {
        PageRequest {
            path: E::LIST_PATH,
            max_results: self.max_results,
            next_token: None,
        }
    }
}

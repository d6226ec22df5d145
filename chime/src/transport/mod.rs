//! Transport seam between the client core and the Chime service.
//!
//! Defines the [`ChimeTransport`] trait every concrete transport must
//! satisfy. The core never issues HTTP requests or speaks the push-channel
//! wire protocol itself; it asks the transport for pages and message posts
//! and tells it which channels to carry. Concrete implementations:
//! - [`local::LocalTransport`], a scripted in-process service for testing

pub mod local;

use serde_json::Value;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection to the service has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The service answered with a non-success HTTP status.
    #[error("service returned {status}: {reason}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason phrase or error body excerpt.
        reason: String,
    },

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async transport trait over the Chime service.
///
/// Implementations carry JSON between the client core and the service. The
/// transport never interprets record contents; parsing and reconciliation
/// happen at higher layers.
pub trait ChimeTransport: Send + Sync {
    /// Fetch one page of a paginated collection endpoint.
    ///
    /// `next_token` is the opaque continuation token from the previous
    /// page, or `None` for the first page. Returns the raw response body.
    fn fetch_page(
        &self,
        path: &str,
        max_results: u32,
        next_token: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Value, TransportError>> + Send;

    /// Post a message body to a messages endpoint.
    ///
    /// Returns the service's response, which carries the full message
    /// record with its server-assigned id and timestamp.
    fn post_message(
        &self,
        path: &str,
        body: &Value,
    ) -> impl std::future::Future<Output = Result<Value, TransportError>> + Send;

    /// Start carrying push events for a channel.
    fn join_channel(&self, channel: &str);

    /// Stop carrying push events for a channel.
    fn leave_channel(&self, channel: &str);
}

impl<T: ChimeTransport> ChimeTransport for std::sync::Arc<T> {
    async fn fetch_page(
        &self,
        path: &str,
        max_results: u32,
        next_token: Option<&str>,
    ) -> Result<Value, TransportError> {
        (**self).fetch_page(path, max_results, next_token).await
    }

    async fn post_message(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
        (**self).post_message(path, body).await
    }

    fn join_channel(&self, channel: &str) {
        (**self).join_channel(channel);
    }

    fn leave_channel(&self, channel: &str) {
        (**self).leave_channel(channel);
    }
}

//! Query building, the fetch worker pool, and page orchestration.

mod pages;
mod pool;
mod query;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use itq_core::{decode_issues_feed, decode_reply_feed, Issue, IssuesFeed, Reply};
use itq_storage::{FeedClient, FetchError};
use tracing::debug;

pub use pages::{batch_issues, BatchResult, IssueResult, PageOrchestrator};
pub use pool::{PageResult, PendingPage, WorkerPool};
pub use query::{QuerySpec, DEFAULT_BASE_URL, DEFAULT_CAN, DEFAULT_PAGE_SIZE};

pub const CRATE_NAME: &str = "itq-query";

/// Performs one GET per call and decodes the body.
///
/// A client injected into the [`QuerySpec`] wins over the executor's own.
#[derive(Clone)]
pub struct FetchExecutor {
    client: Arc<dyn FeedClient>,
}

impl FetchExecutor {
    pub fn new(client: Arc<dyn FeedClient>) -> Self {
        Self { client }
    }

    fn client_for<'a>(&'a self, spec: &'a QuerySpec) -> &'a Arc<dyn FeedClient> {
        spec.client().unwrap_or(&self.client)
    }

    pub async fn fetch_page(&self, spec: &QuerySpec) -> Result<IssuesFeed, FetchError> {
        let url = spec.to_url();
        let body = self.client_for(spec).get(&url).await?;
        let feed = decode_issues_feed(&body)?;
        debug!(url = %url, entries = feed.issues.len(), "decoded issues page");
        Ok(feed)
    }

    /// Replies of one issue. Issues without a replies link have none.
    pub async fn fetch_replies(&self, issue: &Issue) -> Result<Vec<Reply>, FetchError> {
        let Some(url) = issue.replies_url() else {
            return Ok(Vec::new());
        };
        let body = self.client.get(url).await?;
        Ok(decode_reply_feed(&body)?.replies)
    }
}

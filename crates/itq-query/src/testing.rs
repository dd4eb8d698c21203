//! In-memory feed clients shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use itq_storage::{FeedClient, FetchError};
use url::Url;

/// Serves `total` synthetic issues (ids `1..=total`) windowed by
/// `start-index`/`max-results`, and records what was asked for.
pub(crate) struct PagedFeed {
    total: usize,
    items_per_page: Option<usize>,
    page_cap: Option<usize>,
    failing: HashSet<usize>,
    delay: Duration,
    reverse_arrival: bool,
    requested: Mutex<Vec<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl PagedFeed {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            items_per_page: None,
            page_cap: None,
            failing: HashSet::new(),
            delay: Duration::ZERO,
            reverse_arrival: false,
            requested: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_at(mut self, offset: usize) -> Self {
        self.failing.insert(offset);
        self
    }

    /// Report this page size instead of the requested one.
    pub(crate) fn with_items_per_page(mut self, items_per_page: usize) -> Self {
        self.items_per_page = Some(items_per_page);
        self
    }

    /// Serve at most `cap` issues per page, whatever was requested.
    pub(crate) fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Later pages answer sooner, so arrival order inverts page order.
    pub(crate) fn with_reverse_arrival(mut self) -> Self {
        self.reverse_arrival = true;
        self
    }

    /// Offsets requested so far, sorted.
    pub(crate) fn requested_offsets(&self) -> Vec<usize> {
        let mut offsets = self.requested.lock().unwrap().clone();
        offsets.sort_unstable();
        offsets
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn page_xml(&self, offset: usize, limit: usize) -> String {
        let limit = self.page_cap.map_or(limit, |cap| cap.min(limit));
        let items_per_page = self.items_per_page.unwrap_or(limit);
        let last = self.total.min(offset + limit);
        let entries: String = (offset + 1..=last).map(entry_xml).collect();
        format!(
            r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:openSearch="http://a9.com/-/spec/opensearch/1.1/" xmlns:issues="http://schemas.google.com/projecthosting/issues/2009">
<openSearch:totalResults>{}</openSearch:totalResults>
<openSearch:startIndex>{}</openSearch:startIndex>
<openSearch:itemsPerPage>{}</openSearch:itemsPerPage>
{}</feed>"#,
            self.total,
            offset + 1,
            items_per_page,
            entries
        )
    }
}

/// Ids not divisible by five carry `Pri-<id % 3>`.
pub(crate) fn entry_xml(id: usize) -> String {
    let label = if id % 5 == 0 {
        String::new()
    } else {
        format!("<issues:label>Pri-{}</issues:label>", id % 3)
    };
    format!(
        "<entry><issues:id>{id}</issues:id><title>issue {id}</title>{label}<issues:stars>{id}</issues:stars><issues:state>open</issues:state></entry>\n"
    )
}

fn query_param(url: &Url, name: &str) -> Option<usize> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .and_then(|(_, value)| value.parse().ok())
}

#[async_trait]
impl FeedClient for PagedFeed {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|err| FetchError::Transport(err.to_string()))?;
        let offset = query_param(&parsed, "start-index").unwrap_or(1) - 1;
        let limit = query_param(&parsed, "max-results").unwrap_or(25);
        self.requested.lock().unwrap().push(offset);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = if self.reverse_arrival {
            let pages_after = self.total.saturating_sub(offset) / limit.max(1);
            self.delay * (pages_after as u32 + 1)
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&offset) {
            return Err(FetchError::HttpStatus {
                status: 500,
                url: url.to_string(),
            });
        }
        Ok(self.page_xml(offset, limit).into_bytes())
    }
}

/// Answers every request with the same body.
pub(crate) struct StaticFeed {
    body: String,
}

impl StaticFeed {
    pub(crate) fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

#[async_trait]
impl FeedClient for StaticFeed {
    async fn get(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.body.clone().into_bytes())
    }
}

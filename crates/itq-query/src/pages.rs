//! Page fan-out: learn the page count from page 0, then fetch the rest
//! through the worker pool.

use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use itq_core::{Issue, IssuesFeed};
use itq_storage::FetchError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pool::{PageResult, PendingPage, WorkerPool};
use crate::QuerySpec;

pub type IssueResult = Result<Issue, FetchError>;
pub type BatchResult = Result<Vec<Issue>, FetchError>;

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
struct PagePlan {
    page_size: usize,
    page_count: usize,
}

#[derive(Clone)]
pub struct PageOrchestrator {
    pool: Arc<WorkerPool>,
}

impl PageOrchestrator {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Page 0 plus the paging it reports.
    ///
    /// The server's `items_per_page` wins over the requested limit, so
    /// later pages are requested and stepped with that size.
    async fn first_page(&self, base: &QuerySpec) -> Result<(IssuesFeed, PagePlan), FetchError> {
        let first = self.pool.submit(base.with_offset(0)).await?;
        let page_count = first.page_count().ok_or(FetchError::Pagination {
            total_results: first.total_results,
        })?;

        let expected = first.items_per_page.min(first.total_results);
        if page_count > 1 && first.issues.len() < expected {
            return Err(FetchError::ShortPage {
                expected,
                returned: first.issues.len(),
            });
        }
        if first.items_per_page != base.limit() {
            warn!(
                requested = base.limit(),
                items_per_page = first.items_per_page,
                "server changed the page size"
            );
        }

        let plan = PagePlan {
            page_size: first.items_per_page,
            page_count,
        };
        info!(
            project = base.project(),
            total_results = first.total_results,
            items_per_page = first.items_per_page,
            page_count,
            "fetched first page"
        );
        Ok((first, plan))
    }

    /// Submit pages `1..page_count`, all at once.
    fn dispatch_rest(&self, base: &QuerySpec, plan: PagePlan) -> Vec<PendingPage> {
        let base = base.with_limit(plan.page_size);
        (1..plan.page_count)
            .map(|page| {
                let spec = base.with_offset(page * plan.page_size);
                debug!(page, offset = spec.offset(), "dispatching page");
                self.pool.submit(spec)
            })
            .collect()
    }

    /// Every issue of the query, or the first error seen.
    ///
    /// Pages are concatenated in arrival order. All dispatched pages are
    /// awaited before an error is returned.
    pub async fn fetch_all(&self, base: &QuerySpec) -> Result<Vec<Issue>, FetchError> {
        let (first, plan) = self.first_page(base).await?;
        let mut issues = first.issues;

        let mut pending: FuturesUnordered<PendingPage> =
            self.dispatch_rest(base, plan).into_iter().collect();
        let mut first_error = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(page) if first_error.is_none() => issues.extend(page.issues),
                Ok(_) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(issues),
        }
    }

    /// Like [`fetch_all`](Self::fetch_all), but issues come out in page order
    /// and the reported error is the one of the lowest failing page.
    pub async fn fetch_all_ordered(&self, base: &QuerySpec) -> Result<Vec<Issue>, FetchError> {
        let (first, plan) = self.first_page(base).await?;
        let rest = join_all(self.dispatch_rest(base, plan)).await;

        let mut issues = first.issues;
        for page in rest {
            issues.extend(page?.issues);
        }
        Ok(issues)
    }

    /// Pages as they arrive, page 0 first. A failure of page 0 (or an
    /// unusable page size) ends the stream after that one error.
    pub fn stream_pages(&self, base: &QuerySpec) -> mpsc::Receiver<PageResult> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let orchestrator = self.clone();
        let base = base.clone();
        tokio::spawn(async move { orchestrator.forward_pages(&base, tx).await });
        rx
    }

    async fn forward_pages(&self, base: &QuerySpec, tx: mpsc::Sender<PageResult>) {
        let (first, plan) = match self.first_page(base).await {
            Ok(first) => first,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        if tx.send(Ok(first)).await.is_err() {
            return;
        }

        let mut pending: FuturesUnordered<PendingPage> =
            self.dispatch_rest(base, plan).into_iter().collect();
        while let Some(result) = pending.next().await {
            if tx.send(result).await.is_err() {
                debug!("page stream receiver dropped");
                return;
            }
        }
    }

    /// Issues one at a time as pages arrive. A failed page contributes a
    /// single `Err` in place of its issues; the consumer decides whether
    /// to stop.
    pub fn stream_issues(&self, base: &QuerySpec) -> mpsc::Receiver<IssueResult> {
        let mut pages = self.stream_pages(base);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            while let Some(page) = pages.recv().await {
                match page {
                    Ok(page) => {
                        for issue in page.issues {
                            if tx.send(Ok(issue)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        if tx.send(Err(err)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    /// [`stream_issues`](Self::stream_issues) chunked by [`batch_issues`].
    pub fn stream_batches(&self, base: &QuerySpec, batch_size: usize) -> mpsc::Receiver<BatchResult> {
        batch_issues(self.stream_issues(base), batch_size)
    }
}

/// Regroup an issue stream into batches of `batch_size` (at least one).
///
/// A batch is emitted as soon as it fills; leftovers form a final, shorter
/// batch. Errors are passed through between batches.
pub fn batch_issues(mut issues: mpsc::Receiver<IssueResult>, batch_size: usize) -> mpsc::Receiver<BatchResult> {
    let batch_size = batch_size.max(1);
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(batch_size);
        while let Some(item) = issues.recv().await {
            let out = match item {
                Ok(issue) => {
                    batch.push(issue);
                    if batch.len() < batch_size {
                        continue;
                    }
                    Ok(std::mem::replace(&mut batch, Vec::with_capacity(batch_size)))
                }
                Err(err) => Err(err),
            };
            if tx.send(out).await.is_err() {
                return;
            }
        }
        if !batch.is_empty() {
            let _ = tx.send(Ok(batch)).await;
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PagedFeed;
    use crate::FetchExecutor;
    use std::time::Duration;

    fn orchestrator_over(feed: Arc<PagedFeed>, workers: usize) -> PageOrchestrator {
        PageOrchestrator::new(Arc::new(WorkerPool::new(workers, FetchExecutor::new(feed))))
    }

    fn base() -> QuerySpec {
        QuerySpec::new("chromium").with_limit(25)
    }

    async fn drain<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn fifty_seven_results_fetch_three_pages_once_each() {
        let feed = Arc::new(PagedFeed::new(57));
        let orchestrator = orchestrator_over(feed.clone(), 4);

        let issues = orchestrator.fetch_all(&base()).await.expect("fetch");
        assert_eq!(issues.len(), 57);
        assert_eq!(feed.requested_offsets(), vec![0, 25, 50]);

        let mut ids: Vec<u64> = issues.iter().map(|i| i.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=57).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn forty_results_fetch_two_pages() {
        let feed = Arc::new(PagedFeed::new(40));
        let orchestrator = orchestrator_over(feed.clone(), 4);

        let issues = orchestrator.fetch_all(&base()).await.expect("fetch");
        assert_eq!(feed.requested_offsets(), vec![0, 25]);
        assert_eq!(issues.len(), 25 + 15);
    }

    #[tokio::test]
    async fn single_page_needs_no_fan_out() {
        let feed = Arc::new(PagedFeed::new(10));
        let orchestrator = orchestrator_over(feed.clone(), 4);
        assert_eq!(orchestrator.fetch_all(&base()).await.expect("fetch").len(), 10);
        assert_eq!(feed.requested_offsets(), vec![0]);

        let empty = Arc::new(PagedFeed::new(0));
        let orchestrator = orchestrator_over(empty.clone(), 4);
        assert!(orchestrator.fetch_all(&base()).await.expect("fetch").is_empty());
        assert_eq!(empty.requested_offsets(), vec![0]);
    }

    #[tokio::test]
    async fn failing_page_fails_the_whole_batch() {
        let feed = Arc::new(PagedFeed::new(50).failing_at(25));
        let orchestrator = orchestrator_over(feed.clone(), 4);

        let err = orchestrator.fetch_all(&base()).await.unwrap_err();
        match err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 500);
                assert!(url.contains("start-index=26"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(feed.requested_offsets(), vec![0, 25]);
    }

    #[tokio::test]
    async fn batch_mode_drains_every_dispatched_page_before_failing() {
        let feed = Arc::new(
            PagedFeed::new(100)
                .failing_at(25)
                .with_delay(Duration::from_millis(5))
                .with_reverse_arrival(),
        );
        let orchestrator = orchestrator_over(feed.clone(), 4);

        assert!(orchestrator.fetch_all(&base()).await.is_err());
        assert_eq!(feed.requested_offsets(), vec![0, 25, 50, 75]);
    }

    #[tokio::test]
    async fn first_page_failure_stops_before_fan_out() {
        let feed = Arc::new(PagedFeed::new(80).failing_at(0));
        let orchestrator = orchestrator_over(feed.clone(), 4);

        assert!(orchestrator.fetch_all(&base()).await.is_err());
        assert!(orchestrator.fetch_all_ordered(&base()).await.is_err());
        assert_eq!(feed.requested_offsets(), vec![0, 0]);
    }

    #[tokio::test]
    async fn zero_items_per_page_is_a_pagination_error() {
        let feed = Arc::new(PagedFeed::new(30).with_items_per_page(0));
        let orchestrator = orchestrator_over(feed.clone(), 2);

        let err = orchestrator.fetch_all(&base()).await.unwrap_err();
        assert!(matches!(err, FetchError::Pagination { total_results: 30 }));
        assert_eq!(feed.requested_offsets(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn ordered_variant_concatenates_by_page_index() {
        let feed = Arc::new(
            PagedFeed::new(120)
                .with_delay(Duration::from_millis(5))
                .with_reverse_arrival(),
        );
        let orchestrator = orchestrator_over(feed, 5);

        let issues = orchestrator.fetch_all_ordered(&base()).await.expect("fetch");
        assert_eq!(issues.iter().map(|i| i.id).collect::<Vec<_>>(), (1..=120).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn ordered_variant_reports_lowest_failing_page() {
        let feed = Arc::new(PagedFeed::new(100).failing_at(75).failing_at(50));
        let orchestrator = orchestrator_over(feed, 4);

        match orchestrator.fetch_all_ordered(&base()).await.unwrap_err() {
            FetchError::HttpStatus { url, .. } => assert!(url.contains("start-index=51")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stream_tags_failed_page_and_keeps_the_rest() {
        let feed = Arc::new(PagedFeed::new(60).failing_at(25));
        let orchestrator = orchestrator_over(feed, 3);

        let items = drain(orchestrator.stream_issues(&base())).await;
        let ok = items.iter().filter(|item| item.is_ok()).count();
        let errors = items.iter().filter(|item| item.is_err()).count();
        assert_eq!(ok, 25 + 10);
        assert_eq!(errors, 1);
        assert!(items[..25].iter().all(Result::is_ok), "page 0 is streamed first");
    }

    #[tokio::test]
    async fn stream_reports_first_page_failure_once() {
        let feed = Arc::new(PagedFeed::new(60).failing_at(0));
        let orchestrator = orchestrator_over(feed, 3);

        let pages = drain(orchestrator.stream_pages(&base())).await;
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_err());
    }

    #[tokio::test]
    async fn batches_fill_then_flush_remainder() {
        let feed = Arc::new(PagedFeed::new(57));
        let orchestrator = orchestrator_over(feed, 3);

        let batches = drain(orchestrator.stream_batches(&base(), 20)).await;
        let sizes: Vec<usize> = batches.into_iter().map(|b| b.expect("batch").len()).collect();
        assert_eq!(sizes, vec![20, 20, 17]);
    }

    #[tokio::test]
    async fn batching_passes_errors_through() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(Issue { id: 1, ..Issue::default() })).await.unwrap();
        tx.send(Err(FetchError::Transport("reset".into()))).await.unwrap();
        tx.send(Ok(Issue { id: 2, ..Issue::default() })).await.unwrap();
        tx.send(Ok(Issue { id: 3, ..Issue::default() })).await.unwrap();
        drop(tx);

        let out = drain(batch_issues(rx, 2)).await;
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], Err(FetchError::Transport(_))));
        assert_eq!(out[1].as_ref().unwrap().iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(out[2].as_ref().unwrap().iter().map(|i| i.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn zero_batch_size_means_one() {
        let feed = Arc::new(PagedFeed::new(3));
        let orchestrator = orchestrator_over(feed, 1);
        let batches = drain(orchestrator.stream_batches(&base(), 0)).await;
        assert_eq!(batches.len(), 3);
    }

    #[tokio::test]
    async fn capped_page_size_steps_by_reported_size() {
        let feed = Arc::new(PagedFeed::new(57).with_page_cap(25));
        let orchestrator = orchestrator_over(feed.clone(), 4);

        let issues = orchestrator.fetch_all_ordered(&base().with_limit(50)).await.expect("fetch");
        assert_eq!(feed.requested_offsets(), vec![0, 25, 50]);
        assert_eq!(issues.iter().map(|i| i.id).collect::<Vec<_>>(), (1..=57).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn first_page_shorter_than_reported_size_is_an_error() {
        let feed = Arc::new(PagedFeed::new(57).with_items_per_page(25));
        let orchestrator = orchestrator_over(feed.clone(), 4);
        let base = base().with_limit(10);

        let err = orchestrator.fetch_all_ordered(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::ShortPage { expected: 25, returned: 10 }));
        assert!(orchestrator.fetch_all(&base).await.is_err());
        assert_eq!(feed.requested_offsets(), vec![0, 0]);
    }
}

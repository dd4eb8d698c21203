//! Report and refresh pipelines over fetched issues.

mod triage;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itq_core::Issue;
use itq_query::{FetchExecutor, PageOrchestrator, QuerySpec, WorkerPool, DEFAULT_CAN, DEFAULT_PAGE_SIZE};
use itq_storage::{FeedClient, FsIssueStore, HttpClientConfig, HttpFetcher, IssueStore};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub use triage::{CleaningList, IssueRef, PriorityList, Superlatives, TriageReport, LAUNCH_TYPE, UNTRIAGED_STATUS};

pub const CRATE_NAME: &str = "itq-report";

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub project: String,
    pub label: Option<String>,
    pub query: Option<String>,
    pub can: String,
    pub workers: usize,
    pub page_size: usize,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub current_milestone: i64,
    pub batch_size: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub auth_token: Option<String>,
    pub log_level: String,
}

fn parse_var<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|value| value.trim().parse().ok())
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ReportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Self {
            project: var("ITQ_PROJECT").unwrap_or_else(|| "chromium".to_string()),
            label: var("ITQ_LABEL"),
            query: var("ITQ_QUERY"),
            can: var("ITQ_CAN").unwrap_or_else(|| DEFAULT_CAN.to_string()),
            workers: parse_var(var("ITQ_WORKERS")).unwrap_or(20usize).max(1),
            page_size: parse_var(var("ITQ_PAGE_SIZE")).unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            data_dir: var("ITQ_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            reports_dir: var("ITQ_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            current_milestone: parse_var(var("ITQ_CURRENT_MILESTONE")).unwrap_or(42),
            batch_size: parse_var(var("ITQ_BATCH_SIZE")).unwrap_or(25usize).max(1),
            user_agent: var("ITQ_USER_AGENT").unwrap_or_else(|| "itq/0.1".to_string()),
            http_timeout_secs: parse_var(var("ITQ_HTTP_TIMEOUT_SECS")).unwrap_or(20),
            auth_token: var("ITQ_AUTH_TOKEN"),
            log_level: var("ITQ_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    /// The query every pipeline runs, before pagination.
    pub fn base_query(&self) -> QuerySpec {
        let mut spec = QuerySpec::new(self.project.clone())
            .can(self.can.clone())
            .with_limit(self.page_size);
        if let Some(label) = &self.label {
            spec = spec.with_label(label.clone());
        }
        if let Some(query) = &self.query {
            spec = spec.with_query_term(query.clone());
        }
        spec
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.auth_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub project: String,
    pub total_issues: usize,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stored_issues: usize,
    pub batches: usize,
}

pub struct ReportPipeline {
    config: ReportConfig,
    orchestrator: PageOrchestrator,
}

impl ReportPipeline {
    /// Pipeline over the reqwest client described by `config`.
    pub fn new(config: ReportConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config()).context("building feed http client")?;
        Ok(Self::with_client(config, Arc::new(http)))
    }

    /// Spawns the worker pool, so it must run inside a tokio runtime.
    pub fn with_client(config: ReportConfig, client: Arc<dyn FeedClient>) -> Self {
        let pool = WorkerPool::new(config.workers, FetchExecutor::new(client));
        Self {
            config,
            orchestrator: PageOrchestrator::new(Arc::new(pool)),
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &PageOrchestrator {
        &self.orchestrator
    }

    pub async fn fetch_issues(&self) -> Result<Vec<Issue>> {
        let spec = self.config.base_query();
        let issues = self
            .orchestrator
            .fetch_all(&spec)
            .await
            .with_context(|| format!("fetching issues for project {}", self.config.project))?;
        info!(project = %self.config.project, count = issues.len(), "fetched issues");
        Ok(issues)
    }

    pub async fn run_report(&self) -> Result<ReportRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let issues = self.fetch_issues().await?;
        let report = TriageReport::build(&self.config.project, &issues, self.config.current_milestone);
        let reports_dir = self.write_report(run_id, &report).await?;

        Ok(ReportRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            project: self.config.project.clone(),
            total_issues: report.total,
            reports_dir: reports_dir.display().to_string(),
        })
    }

    /// Writes `triage.json` and `triage_brief.md` under `<reports_dir>/<run_id>/`.
    pub async fn write_report(&self, run_id: Uuid, report: &TriageReport) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(report).context("serializing triage report")?;
        fs::write(reports_dir.join("triage.json"), json)
            .await
            .context("writing triage.json")?;
        fs::write(reports_dir.join("triage_brief.md"), report.to_markdown())
            .await
            .context("writing triage_brief.md")?;

        debug!(dir = %reports_dir.display(), "report written");
        Ok(reports_dir)
    }

    /// Replace the store's contents with a fresh fetch.
    ///
    /// The last-update timestamp is the refresh start time, and is only
    /// written once every batch has been stored.
    pub async fn run_refresh(&self, store: &dyn IssueStore) -> Result<RefreshSummary> {
        let started_at = Utc::now();
        store.delete_all_issues().await.context("clearing stored issues")?;
        store.delete_last_update().await.context("clearing last update")?;

        let mut batches = self
            .orchestrator
            .stream_batches(&self.config.base_query(), self.config.batch_size);
        let mut stored_issues = 0;
        let mut batch_count = 0;
        while let Some(batch) = batches.recv().await {
            let batch = batch.with_context(|| format!("refreshing project {}", self.config.project))?;
            store.put_issues(&batch).await.context("storing issue batch")?;
            stored_issues += batch.len();
            batch_count += 1;
            debug!(batch = batch_count, size = batch.len(), "stored batch");
        }

        store
            .set_last_update(started_at)
            .await
            .context("recording last update")?;
        info!(stored_issues, batches = batch_count, "refresh complete");

        Ok(RefreshSummary {
            started_at,
            finished_at: Utc::now(),
            stored_issues,
            batches: batch_count,
        })
    }

    pub async fn shutdown(&self) {
        self.orchestrator.pool().shutdown().await;
    }
}

pub async fn run_report_from_env() -> Result<ReportRunSummary> {
    let pipeline = ReportPipeline::new(ReportConfig::from_env())?;
    let summary = pipeline.run_report().await;
    pipeline.shutdown().await;
    summary
}

pub async fn run_refresh_from_env() -> Result<RefreshSummary> {
    let config = ReportConfig::from_env();
    let store = FsIssueStore::new(config.data_dir.clone());
    let pipeline = ReportPipeline::new(config)?;
    let summary = pipeline.run_refresh(&store).await;
    pipeline.shutdown().await;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use itq_storage::{FetchError, MemoryIssueStore};
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Serves `total` issues, 10 per page, optionally failing one start index.
    struct TrackerFeed {
        total: usize,
        fail_start: Option<usize>,
    }

    #[async_trait]
    impl FeedClient for TrackerFeed {
        async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let start: usize = url
                .split(['?', '&'])
                .find_map(|pair| pair.strip_prefix("start-index="))
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            if Some(start) == self.fail_start {
                return Err(FetchError::Transport("connection reset".into()));
            }
            let entries: String = (start..=self.total.min(start + 9))
                .map(|id| {
                    let milestone = if id % 2 == 0 { 42 } else { 41 };
                    format!(
                        "<entry><id>{id}</id><title>t{id}</title><label>M-{milestone}</label><label>Pri-1</label><stars>{id}</stars><status>Untriaged</status></entry>"
                    )
                })
                .collect();
            Ok(format!(
                "<feed><totalResults>{}</totalResults><startIndex>{start}</startIndex><itemsPerPage>10</itemsPerPage>{entries}</feed>",
                self.total
            )
            .into_bytes())
        }
    }

    fn config(reports_dir: PathBuf) -> ReportConfig {
        ReportConfig {
            page_size: 10,
            workers: 3,
            batch_size: 7,
            reports_dir,
            ..ReportConfig::default()
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = ReportConfig::default();
        assert_eq!(defaults.project, "chromium");
        assert_eq!(defaults.workers, 20);
        assert_eq!(defaults.page_size, 25);
        assert_eq!(defaults.current_milestone, 42);
        assert_eq!(defaults.can, "open");
        assert!(defaults.label.is_none());

        let vars: HashMap<&str, &str> = HashMap::from([
            ("ITQ_PROJECT", "v8"),
            ("ITQ_LABEL", "Cr-Blink"),
            ("ITQ_QUERY", "owner:me"),
            ("ITQ_WORKERS", "0"),
            ("ITQ_PAGE_SIZE", "not-a-number"),
            ("ITQ_AUTH_TOKEN", ""),
        ]);
        let config = ReportConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.project, "v8");
        assert_eq!(config.workers, 1);
        assert_eq!(config.page_size, 25);
        assert!(config.auth_token.is_none());

        let url = config.base_query().to_url();
        assert!(url.contains("/p/v8/"));
        assert!(url.contains("label=Cr-Blink"));
        assert!(url.contains("q=owner%3Ame"));
    }

    #[test]
    fn http_config_carries_timeout_and_token() {
        let config = ReportConfig {
            http_timeout_secs: 5,
            auth_token: Some("tok".into()),
            ..ReportConfig::default()
        };
        let http = config.http_config();
        assert_eq!(http.timeout, Duration::from_secs(5));
        assert_eq!(http.bearer_token.as_deref(), Some("tok"));
        assert_eq!(http.user_agent.as_deref(), Some("itq/0.1"));
    }

    #[tokio::test]
    async fn report_run_writes_json_and_brief() {
        let dir = tempdir().expect("tempdir");
        let pipeline = ReportPipeline::with_client(
            config(dir.path().to_path_buf()),
            Arc::new(TrackerFeed { total: 23, fail_start: None }),
        );

        let summary = pipeline.run_report().await.expect("report");
        assert_eq!(summary.total_issues, 23);

        let run_dir = dir.path().join(summary.run_id.to_string());
        let json = std::fs::read(run_dir.join("triage.json")).expect("json");
        let report: TriageReport = serde_json::from_slice(&json).expect("parse");
        assert_eq!(report.total, 23);
        assert_eq!(report.priority.p1, 23);
        assert_eq!(report.cleaning.old_milestone, 12);
        assert_eq!(report.superlatives.most_starred.map(|i| i.id), Some(23));

        let brief = std::fs::read_to_string(run_dir.join("triage_brief.md")).expect("brief");
        assert!(brief.contains("- Untriaged: 23"));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_replaces_store_contents_and_stamps_start_time() {
        let store = MemoryIssueStore::new();
        store
            .put_issues(&[Issue { id: 999, ..Issue::default() }])
            .await
            .expect("seed");

        let pipeline = ReportPipeline::with_client(
            config(PathBuf::from("unused")),
            Arc::new(TrackerFeed { total: 23, fail_start: None }),
        );
        let before = Utc::now();
        let summary = pipeline.run_refresh(&store).await.expect("refresh");

        assert_eq!(summary.stored_issues, 23);
        assert_eq!(summary.batches, 4);
        let ids: Vec<u64> = store.all_issues().await.expect("list").iter().map(|i| i.id).collect();
        assert_eq!(ids, (1..=23).collect::<Vec<_>>());

        let stamped = store.last_update().await.expect("read").expect("stamped");
        assert_eq!(stamped, summary.started_at);
        assert!(stamped >= before);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_no_timestamp() {
        let store = MemoryIssueStore::new();
        store.set_last_update(Utc::now()).await.expect("seed");

        let pipeline = ReportPipeline::with_client(
            config(PathBuf::from("unused")),
            Arc::new(TrackerFeed { total: 23, fail_start: Some(11) }),
        );
        let err = pipeline.run_refresh(&store).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection reset"));
        assert_eq!(store.last_update().await.expect("read"), None);
    }
}

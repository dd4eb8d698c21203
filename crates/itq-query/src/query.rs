//! Immutable description of one issues-feed request.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use itq_storage::FeedClient;
use url::form_urlencoded;

pub const DEFAULT_BASE_URL: &str = "https://code.google.com";
pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const DEFAULT_CAN: &str = "open";

const DATE_TERM_FORMAT: &str = "%Y/%m/%d";

/// Every `with_*` method returns a new spec; the receiver is never touched,
/// so one spec can be shared across concurrently running page fetches.
#[derive(Clone)]
pub struct QuerySpec {
    base_url: String,
    project: String,
    terms: Vec<String>,
    params: BTreeMap<String, String>,
    offset: usize,
    limit: usize,
    client: Option<Arc<dyn FeedClient>>,
}

impl QuerySpec {
    pub fn new(project: impl Into<String>) -> Self {
        let mut params = BTreeMap::new();
        params.insert("can".to_string(), DEFAULT_CAN.to_string());
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            project: project.into(),
            terms: Vec::new(),
            params,
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
            client: None,
        }
    }

    fn derive(&self, change: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        change(&mut next);
        next
    }

    pub fn with_filter(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.derive(|q| {
            q.params.insert(name, value);
        })
    }

    pub fn can(&self, can: impl Into<String>) -> Self {
        self.with_filter("can", can)
    }

    pub fn open(&self) -> Self {
        self.can("open")
    }

    pub fn all(&self) -> Self {
        self.can("all")
    }

    pub fn with_label(&self, label: impl Into<String>) -> Self {
        self.with_filter("label", label)
    }

    pub fn with_query_term(&self, term: impl Into<String>) -> Self {
        let term = term.into();
        self.derive(|q| q.terms.push(term))
    }

    fn with_date_term(&self, attribute: &str, date: NaiveDate) -> Self {
        self.with_query_term(format!("{attribute}:{}", date.format(DATE_TERM_FORMAT)))
    }

    /// Adds `<attribute>-after:<start>` and `<attribute>-before:<end>` terms.
    pub fn with_date_range(&self, attribute: &str, start: NaiveDate, end: NaiveDate) -> Self {
        self.with_date_term(&format!("{attribute}-after"), start)
            .with_date_term(&format!("{attribute}-before"), end)
    }

    pub fn opened_before(&self, date: NaiveDate) -> Self {
        self.with_date_term("opened-before", date)
    }

    pub fn opened_after(&self, date: NaiveDate) -> Self {
        self.with_date_term("opened-after", date)
    }

    pub fn opened_in_range(&self, start: NaiveDate, end: NaiveDate) -> Self {
        self.all().with_date_range("opened", start, end)
    }

    pub fn closed_before(&self, date: NaiveDate) -> Self {
        self.with_date_term("closed-before", date)
    }

    pub fn closed_after(&self, date: NaiveDate) -> Self {
        self.with_date_term("closed-after", date)
    }

    pub fn closed_in_range(&self, start: NaiveDate, end: NaiveDate) -> Self {
        self.all().with_date_range("closed", start, end)
    }

    pub fn with_offset(&self, offset: usize) -> Self {
        self.derive(|q| q.offset = offset)
    }

    pub fn with_limit(&self, limit: usize) -> Self {
        self.derive(|q| q.limit = limit)
    }

    pub fn with_client(&self, client: Arc<dyn FeedClient>) -> Self {
        self.derive(|q| q.client = Some(client))
    }

    /// Point at another origin serving the same feed paths.
    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.derive(|q| q.base_url = base_url)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn filter(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn client(&self) -> Option<&Arc<dyn FeedClient>> {
        self.client.as_ref()
    }

    /// Feed URL for this page. Parameters are emitted in name order.
    pub fn to_url(&self) -> String {
        let mut pairs: BTreeMap<&str, String> = self
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value.clone()))
            .collect();
        pairs.insert("max-results", self.limit.to_string());
        pairs.insert("start-index", (self.offset + 1).to_string());
        if !self.terms.is_empty() {
            pairs.insert("q", self.terms.join(" "));
        }

        let mut query = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &pairs {
            query.append_pair(name, value);
        }

        format!(
            "{}/feeds/issues/p/{}/issues/full?{}",
            self.base_url.trim_end_matches('/'),
            self.project,
            query.finish()
        )
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .field("terms", &self.terms)
            .field("params", &self.params)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("client", &self.client.as_ref().map(|_| "<injected>"))
            .finish()
    }
}

//! Core domain model for tracked issues: feed pages, label facets, grouping.

mod decode;
mod grouping;
mod properties;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub use decode::{decode_issues_feed, decode_reply_feed, DecodeError};
pub use grouping::{
    group_by, Bucket, BucketKey, BucketOrder, BucketSummary, GroupKey, Grouped,
    ABSENT_KEY_STRING,
};
pub use properties::{
    IssueType, Milestone, Os, Owner, Priority, Property, PropertyExtractor, Published, Stars,
    Status, UnknownProperty, Updated,
};

pub const CRATE_NAME: &str = "itq-core";

/// Wire format of `published` / `updated`, e.g. `2015-02-18T00:36:15.000Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub const REPLIES_REL: &str = "replies";
pub const ATOM_MEDIA_TYPE: &str = "application/atom+xml";

/// Atom `<link rel=".." type=".." href=".."/>`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub media_type: String,
    pub href: String,
}

/// One tracked issue as carried by an issues feed entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Issue {
    pub id: u64,
    pub title: String,
    pub content: String,
    pub published: String,
    pub updated: String,
    pub author: Option<String>,
    pub labels: Vec<String>,
    pub owner: Option<String>,
    pub ccs: Vec<String>,
    pub stars: u32,
    pub state: String,
    pub status: String,
    pub links: Vec<Link>,
}

impl Issue {
    /// Suffixes of every label starting with `prefix`.
    pub fn labels_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.labels
            .iter()
            .filter_map(move |label| label.strip_prefix(prefix))
    }

    /// The facet value for `prefix`, present only when exactly one label carries it.
    pub fn label_with_prefix(&self, prefix: &str) -> Option<&str> {
        let mut matches = self
            .labels
            .iter()
            .filter_map(|label| label.strip_prefix(prefix));
        let first = matches.next()?;
        match matches.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    pub fn int_label_with_prefix(&self, prefix: &str) -> Option<i64> {
        self.label_with_prefix(prefix)?.parse().ok()
    }

    pub fn component_labels(&self) -> Vec<&str> {
        self.labels_with_prefix("Cr-").collect()
    }

    pub fn priority(&self) -> Option<i64> {
        self.int_label_with_prefix("Pri-")
    }

    pub fn milestone(&self) -> Option<i64> {
        self.int_label_with_prefix("M-")
    }

    pub fn issue_type(&self) -> Option<&str> {
        self.label_with_prefix("Type-")
    }

    pub fn os(&self) -> Option<&str> {
        self.label_with_prefix("OS-")
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.published)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.updated)
    }

    /// Location of the reply sub-feed, if the entry links one.
    pub fn replies_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| link.rel == REPLIES_REL && link.media_type == ATOM_MEDIA_TYPE)
            .map(|link| link.href.as_str())
    }
}

/// One page of an issues query plus its pagination metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IssuesFeed {
    pub total_results: usize,
    pub start_index: usize,
    pub items_per_page: usize,
    pub links: Vec<Link>,
    pub issues: Vec<Issue>,
}

impl IssuesFeed {
    /// `ceil(total_results / items_per_page)`; `None` when the page size is zero.
    pub fn page_count(&self) -> Option<usize> {
        if self.items_per_page == 0 {
            return None;
        }
        Some(self.total_results.div_ceil(self.items_per_page))
    }
}

/// Changes recorded by a single reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyUpdates {
    pub cc_changes: Vec<String>,
    pub label_changes: Vec<String>,
    pub status_change: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reply {
    pub title: String,
    pub content: String,
    pub published: String,
    pub updated: String,
    pub author: Option<String>,
    pub links: Vec<Link>,
    pub updates: ReplyUpdates,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyFeed {
    pub total_results: usize,
    pub start_index: usize,
    pub items_per_page: usize,
    pub replies: Vec<Reply>,
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

//! Named extraction rules over [`Issue`] and a registry to pick them by name.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::grouping::{group_by, BucketOrder, BucketSummary, GroupKey, Grouped};
use crate::Issue;

/// A rule that derives one optional, groupable value from an issue.
pub trait PropertyExtractor {
    type Key: GroupKey;

    fn name(&self) -> &'static str;

    fn extract(&self, issue: &Issue) -> Option<Self::Key>;

    fn group<R: Borrow<Issue>>(&self, records: impl IntoIterator<Item = R>) -> Grouped<Self::Key, R>
    where
        Self: Sized,
    {
        group_by(records, |record| {
            self.extract(<R as Borrow<Issue>>::borrow(record))
        })
    }
}

macro_rules! extractor {
    ($(#[$meta:meta])* $ty:ident, $name:literal, $key:ty, |$issue:ident| $body:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $ty;

        impl PropertyExtractor for $ty {
            type Key = $key;

            fn name(&self) -> &'static str {
                $name
            }

            fn extract(&self, $issue: &Issue) -> Option<$key> {
                $body
            }
        }
    };
}

extractor!(
    /// `Pri-<n>` label.
    Priority, "priority", i64, |issue| issue.priority()
);
extractor!(
    /// `M-<n>` label.
    Milestone, "milestone", i64, |issue| issue.milestone()
);
extractor!(Stars, "stars", u32, |issue| Some(issue.stars));
extractor!(Owner, "owner", String, |issue| issue.owner.clone());
extractor!(Status, "status", String, |issue| {
    (!issue.status.is_empty()).then(|| issue.status.clone())
});
extractor!(
    /// `Type-<name>` label.
    IssueType, "type", String, |issue| issue.issue_type().map(str::to_string)
);
extractor!(
    /// `OS-<name>` label.
    Os, "os", String, |issue| issue.os().map(str::to_string)
);
extractor!(Published, "published", DateTime<Utc>, |issue| issue.published_at());
extractor!(Updated, "updated", DateTime<Utc>, |issue| issue.updated_at());

/// Every registered extraction rule, addressable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Priority,
    Milestone,
    Stars,
    Owner,
    Status,
    Type,
    Os,
    Published,
    Updated,
}

#[derive(Debug, Error)]
#[error("unknown property {0:?} (expected one of: {names})", names = Property::names().join(", "))]
pub struct UnknownProperty(pub String);

impl Property {
    pub const ALL: [Property; 9] = [
        Property::Priority,
        Property::Milestone,
        Property::Stars,
        Property::Owner,
        Property::Status,
        Property::Type,
        Property::Os,
        Property::Published,
        Property::Updated,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Property::Priority => Priority.name(),
            Property::Milestone => Milestone.name(),
            Property::Stars => Stars.name(),
            Property::Owner => Owner.name(),
            Property::Status => Status.name(),
            Property::Type => IssueType.name(),
            Property::Os => Os.name(),
            Property::Published => Published.name(),
            Property::Updated => Updated.name(),
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|p| p.name()).collect()
    }

    /// Group `issues` by this property and flatten the buckets to display rows.
    pub fn summarize(self, issues: &[Issue], order: BucketOrder) -> Vec<BucketSummary> {
        match self {
            Property::Priority => Priority.group(issues).summaries(order),
            Property::Milestone => Milestone.group(issues).summaries(order),
            Property::Stars => Stars.group(issues).summaries(order),
            Property::Owner => Owner.group(issues).summaries(order),
            Property::Status => Status.group(issues).summaries(order),
            Property::Type => IssueType.group(issues).summaries(order),
            Property::Os => Os.group(issues).summaries(order),
            Property::Published => Published.group(issues).summaries(order),
            Property::Updated => Updated.group(issues).summaries(order),
        }
    }

    /// Number of issues the property has no value for.
    pub fn absent_count(self, issues: &[Issue]) -> usize {
        match self {
            Property::Priority => Priority.group(issues).absent().len(),
            Property::Milestone => Milestone.group(issues).absent().len(),
            Property::Stars => Stars.group(issues).absent().len(),
            Property::Owner => Owner.group(issues).absent().len(),
            Property::Status => Status.group(issues).absent().len(),
            Property::Type => IssueType.group(issues).absent().len(),
            Property::Os => Os.group(issues).absent().len(),
            Property::Published => Published.group(issues).absent().len(),
            Property::Updated => Updated.group(issues).absent().len(),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = UnknownProperty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| UnknownProperty(s.to_string()))
    }
}

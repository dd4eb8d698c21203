//! Triage report: cleaning counts, priority list, superlatives.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use itq_core::{
    BucketOrder, BucketSummary, Issue, IssueType, Milestone, Os, Owner, Priority, Property,
    PropertyExtractor, Published, Stars, Status, Updated,
};
use serde::{Deserialize, Serialize};

pub const UNTRIAGED_STATUS: &str = "Untriaged";
pub const LAUNCH_TYPE: &str = "Launch";

const SAMPLE_PROPERTIES: [Property; 6] = [
    Property::Priority,
    Property::Milestone,
    Property::Type,
    Property::Os,
    Property::Status,
    Property::Owner,
];

/// Just enough of an issue to point a reader at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub id: u64,
    pub title: String,
    pub stars: u32,
    pub published: String,
    pub updated: String,
}

impl From<&Issue> for IssueRef {
    fn from(issue: &Issue) -> Self {
        Self {
            id: issue.id,
            title: issue.title.clone(),
            stars: issue.stars,
            published: issue.published.clone(),
            updated: issue.updated.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningList {
    pub untriaged: usize,
    pub no_owner: usize,
    pub no_milestone: usize,
    pub no_priority: usize,
    pub no_type: usize,
    pub no_status: usize,
    pub no_os: usize,
    /// Issues still targeted at a milestone before the current one.
    pub old_milestone: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityList {
    pub p1: usize,
    pub current_launch_bugs: Vec<u64>,
    pub next_launch_bugs: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superlatives {
    pub most_starred: Option<IssueRef>,
    pub oldest_published: Option<IssueRef>,
    pub oldest_updated: Option<IssueRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageReport {
    pub project: String,
    pub current_milestone: i64,
    pub total: usize,
    pub cleaning: CleaningList,
    pub priority: PriorityList,
    pub superlatives: Superlatives,
    /// Bucket counts per property, in key order.
    pub samples: BTreeMap<String, Vec<BucketSummary>>,
}

fn launch_bugs(milestone_members: &[&Issue]) -> Vec<u64> {
    IssueType
        .group(milestone_members.iter().copied())
        .get(&LAUNCH_TYPE.to_string())
        .iter()
        .map(|issue| issue.id)
        .collect()
}

impl TriageReport {
    pub fn build(project: &str, issues: &[Issue], current_milestone: i64) -> Self {
        let milestones = Milestone.group(issues);
        let statuses = Status.group(issues);
        let priorities = Priority.group(issues);

        let cleaning = CleaningList {
            untriaged: statuses.get(&UNTRIAGED_STATUS.to_string()).len(),
            no_owner: Owner.group(issues).absent().len(),
            no_milestone: milestones.absent().len(),
            no_priority: priorities.absent().len(),
            no_type: IssueType.group(issues).absent().len(),
            no_status: statuses.absent().len(),
            no_os: Os.group(issues).absent().len(),
            old_milestone: milestones.members_where(|m| *m < current_milestone).len(),
        };

        let priority = PriorityList {
            p1: priorities.get(&1).len(),
            current_launch_bugs: launch_bugs(milestones.get(&current_milestone)),
            next_launch_bugs: launch_bugs(milestones.get(&(current_milestone + 1))),
        };

        // Extractors with no value for an issue never win a superlative.
        let stars = Stars.group(issues);
        let published = Published.group(issues);
        let updated = Updated.group(issues);
        let superlatives = Superlatives {
            most_starred: stars
                .by_key()
                .into_iter()
                .rev()
                .find(|bucket| !bucket.key().is_absent())
                .and_then(|bucket| bucket.members().first().map(|issue| IssueRef::from(*issue))),
            oldest_published: published
                .by_key()
                .into_iter()
                .find(|bucket| !bucket.key().is_absent())
                .and_then(|bucket| bucket.members().first().map(|issue| IssueRef::from(*issue))),
            oldest_updated: updated
                .by_key()
                .into_iter()
                .find(|bucket| !bucket.key().is_absent())
                .and_then(|bucket| bucket.members().first().map(|issue| IssueRef::from(*issue))),
        };

        let samples = SAMPLE_PROPERTIES
            .into_iter()
            .map(|property| {
                (
                    property.name().to_string(),
                    property.summarize(issues, BucketOrder::ByKey),
                )
            })
            .collect();

        Self {
            project: project.to_string(),
            current_milestone,
            total: issues.len(),
            cleaning,
            priority,
            superlatives,
            samples,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let m = self.current_milestone;
        let _ = writeln!(out, "# {} triage\n", self.project);
        let _ = writeln!(out, "- Total issues: {}\n", self.total);

        let c = &self.cleaning;
        let _ = writeln!(out, "## Cleaning list\n");
        let _ = writeln!(out, "- Untriaged: {}", c.untriaged);
        let _ = writeln!(out, "- No owner: {}", c.no_owner);
        let _ = writeln!(out, "- No milestone: {}", c.no_milestone);
        let _ = writeln!(out, "- No priority: {}", c.no_priority);
        let _ = writeln!(out, "- No type: {}", c.no_type);
        let _ = writeln!(out, "- No status: {}", c.no_status);
        let _ = writeln!(out, "- No OS: {}", c.no_os);
        let _ = writeln!(out, "- Old milestones (< M{m}): {}\n", c.old_milestone);

        let p = &self.priority;
        let _ = writeln!(out, "## Priority list\n");
        let _ = writeln!(out, "- P1: {}", p.p1);
        let _ = writeln!(out, "- M{m} launch bugs: {}", p.current_launch_bugs.len());
        let _ = writeln!(out, "- M{} launch bugs: {}\n", m + 1, p.next_launch_bugs.len());

        let s = &self.superlatives;
        let _ = writeln!(out, "## Superlatives\n");
        let line = |label: &str, issue: &Option<IssueRef>, detail: fn(&IssueRef) -> String| match issue {
            Some(issue) => format!("- {label}: #{} ({})", issue.id, detail(issue)),
            None => format!("- {label}: none"),
        };
        let _ = writeln!(out, "{}", line("Top stars", &s.most_starred, |i| i.stars.to_string()));
        let _ = writeln!(out, "{}", line("Oldest published", &s.oldest_published, |i| i.published.clone()));
        let _ = writeln!(out, "{}", line("Oldest updated", &s.oldest_updated, |i| i.updated.clone()));

        for (property, buckets) in &self.samples {
            let _ = writeln!(out, "\n## By {property}\n");
            for bucket in buckets {
                let _ = writeln!(out, "- {}: {}", bucket.key, bucket.count);
            }
        }
        out
    }
}

//! Atom feed decoding for issue and reply feeds.
//!
//! Elements are matched on their local names, so `openSearch:totalResults`,
//! `issues:label` and friends are addressed as `totalResults`, `label`, ...

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::{Issue, IssuesFeed, Link, Reply, ReplyFeed};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed feed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid number in <{field}>: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("document has no <feed> root element")]
    MissingFeed,
}

/// Receives element boundaries while a feed document is walked.
trait FeedSink {
    fn start(&mut self, path: &[&str], element: &BytesStart<'_>) -> Result<(), DecodeError>;
    fn end(&mut self, path: &[&str], text: String) -> Result<(), DecodeError>;
}

fn walk(bytes: &[u8], sink: &mut impl FeedSink) -> Result<(), DecodeError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut saw_feed = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => {
                path.push(local_name(&element));
                saw_feed |= path.len() == 1 && path[0] == "feed";
                text.clear();
                sink.start(&path_refs(&path), &element)?;
            }
            Event::Empty(element) => {
                path.push(local_name(&element));
                let refs = path_refs(&path);
                sink.start(&refs, &element)?;
                sink.end(&refs, String::new())?;
                path.pop();
            }
            Event::Text(chunk) => text.push_str(&chunk.unescape()?),
            Event::CData(chunk) => text.push_str(&String::from_utf8_lossy(&chunk.into_inner())),
            Event::End(_) => {
                sink.end(&path_refs(&path), std::mem::take(&mut text))?;
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if saw_feed {
        Ok(())
    } else {
        Err(DecodeError::MissingFeed)
    }
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn path_refs(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

fn link_from(element: &BytesStart<'_>) -> Result<Link, DecodeError> {
    let mut link = Link::default();
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.local_name().as_ref() {
            b"rel" => link.rel = value,
            b"type" => link.media_type = value,
            b"href" => link.href = value,
            _ => {}
        }
    }
    Ok(link)
}

/// Empty numeric elements decode as zero.
fn number<T: std::str::FromStr + Default>(field: &'static str, text: &str) -> Result<T, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(T::default());
    }
    trimmed.parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: trimmed.to_string(),
    })
}

/// Both the atom id (`.../issues/full/123`) and `issues:id` end in the issue number.
fn issue_id(text: &str) -> Result<u64, DecodeError> {
    let tail = text.trim().rsplit('/').next().unwrap_or_default();
    number("id", tail)
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Default)]
struct IssuesFeedSink {
    feed: IssuesFeed,
    current: Option<Issue>,
}

impl FeedSink for IssuesFeedSink {
    fn start(&mut self, path: &[&str], element: &BytesStart<'_>) -> Result<(), DecodeError> {
        match path {
            ["feed", "link"] => self.feed.links.push(link_from(element)?),
            ["feed", "entry"] => self.current = Some(Issue::default()),
            ["feed", "entry", "link"] => {
                if let Some(issue) = self.current.as_mut() {
                    issue.links.push(link_from(element)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, path: &[&str], text: String) -> Result<(), DecodeError> {
        match path {
            ["feed", "totalResults"] => self.feed.total_results = number("totalResults", &text)?,
            ["feed", "startIndex"] => self.feed.start_index = number("startIndex", &text)?,
            ["feed", "itemsPerPage"] => self.feed.items_per_page = number("itemsPerPage", &text)?,
            ["feed", "entry"] => {
                if let Some(issue) = self.current.take() {
                    self.feed.issues.push(issue);
                }
            }
            ["feed", "entry", rest @ ..] => {
                let Some(issue) = self.current.as_mut() else {
                    return Ok(());
                };
                match rest {
                    ["id"] => issue.id = issue_id(&text)?,
                    ["title"] => issue.title = text,
                    ["content"] => issue.content = text,
                    ["published"] => issue.published = text,
                    ["updated"] => issue.updated = text,
                    ["author", "name"] => issue.author = non_empty(text),
                    ["label"] => issue.labels.push(text),
                    ["owner", "username"] => issue.owner = non_empty(text),
                    ["cc", "username"] => issue.ccs.push(text),
                    ["stars"] => issue.stars = number("stars", &text)?,
                    ["state"] => issue.state = text,
                    ["status"] => issue.status = text,
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Default)]
struct ReplyFeedSink {
    feed: ReplyFeed,
    current: Option<Reply>,
}

impl FeedSink for ReplyFeedSink {
    fn start(&mut self, path: &[&str], element: &BytesStart<'_>) -> Result<(), DecodeError> {
        match path {
            ["feed", "entry"] => self.current = Some(Reply::default()),
            ["feed", "entry", "link"] => {
                if let Some(reply) = self.current.as_mut() {
                    reply.links.push(link_from(element)?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn end(&mut self, path: &[&str], text: String) -> Result<(), DecodeError> {
        match path {
            ["feed", "totalResults"] => self.feed.total_results = number("totalResults", &text)?,
            ["feed", "startIndex"] => self.feed.start_index = number("startIndex", &text)?,
            ["feed", "itemsPerPage"] => self.feed.items_per_page = number("itemsPerPage", &text)?,
            ["feed", "entry"] => {
                if let Some(reply) = self.current.take() {
                    self.feed.replies.push(reply);
                }
            }
            ["feed", "entry", rest @ ..] => {
                let Some(reply) = self.current.as_mut() else {
                    return Ok(());
                };
                match rest {
                    ["title"] => reply.title = text,
                    ["content"] => reply.content = text,
                    ["published"] => reply.published = text,
                    ["updated"] => reply.updated = text,
                    ["author", "name"] => reply.author = non_empty(text),
                    ["updates", "ccUpdate"] => reply.updates.cc_changes.push(text),
                    ["updates", "label"] => reply.updates.label_changes.push(text),
                    ["updates", "status"] => reply.updates.status_change = Some(text),
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Decode one page of an issues feed.
pub fn decode_issues_feed(bytes: &[u8]) -> Result<IssuesFeed, DecodeError> {
    let mut sink = IssuesFeedSink::default();
    walk(bytes, &mut sink)?;
    Ok(sink.feed)
}

/// Decode a reply sub-feed (the `replies` link of an issue).
pub fn decode_reply_feed(bytes: &[u8]) -> Result<ReplyFeed, DecodeError> {
    let mut sink = ReplyFeedSink::default();
    walk(bytes, &mut sink)?;
    Ok(sink.feed)
}

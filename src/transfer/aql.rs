// src/transfer/aql.rs

//! AQL query builders for the source server
//!
//! Two query shapes: listing the immediate contents of one folder, and
//! finding files modified inside a time window. Both emit a stable textual
//! form; the diff machinery depends on the window query being byte-stable
//! for a given input.

use chrono::{DateTime, SecondsFormat, Utc};

/// Query for the immediate children (files and folders) of one directory.
/// `relative_path` is matched exactly; "." denotes the repository root.
pub fn folder_contents_query(repo_key: &str, relative_path: &str) -> String {
    format!(
        r#"items.find({{"type":"any","$or":[{{"$and":[{{"repo":"{repo_key}","path":{{"$match":"{relative_path}"}},"name":{{"$match":"*"}}}}]}}]}}).include("repo","path","name","type")"#
    )
}

/// Query for files whose `modified` time falls inside `[from, to)`
pub fn modified_window_query(
    repo_key: &str,
    from: &DateTime<Utc>,
    to: &DateTime<Utc>,
) -> String {
    let from = format_window_bound(from);
    let to = format_window_bound(to);
    format!(
        r#"items.find({{"type":"file","modified":{{"$gte":"{from}"}},"modified":{{"$lt":"{to}"}},"$or":[{{"$and":[{{"repo":"{repo_key}","path":{{"$match":"*"}},"name":{{"$match":"*"}}}}]}}]}}).include("repo","path","name")"#
    )
}

/// RFC 3339 with whole seconds; the source indexes `modified` at second
/// granularity and a stable form keeps the emitted query deterministic.
fn format_window_bound(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

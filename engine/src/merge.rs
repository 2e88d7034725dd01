//! Last-writer-wins merge of server and local collections.
//!
//! This is the core of session sync. Given the records a server holds and
//! the records a client holds, it produces one collection where every id
//! appears once, carrying its most recent version.
//!
//! # Algorithm
//!
//! 1. Seed a map keyed by id with every server record
//! 2. For each local record: insert it if the id is new, replace the
//!    existing entry only if the local `updated_at` is strictly greater
//! 3. Emit the map's values sorted by `updated_at` descending (ties by id)
//!
//! Equal timestamps keep the server copy. Nothing is ever deleted: a record
//! present on either side is present in the output.

use crate::Syncable;
use std::collections::BTreeMap;

/// How each id in a merge was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids only the server had
    pub server_only: usize,
    /// Ids only the client had
    pub local_only: usize,
    /// Ids on both sides where the local copy was strictly newer
    pub local_wins: usize,
    /// Ids on both sides where the server copy was kept (newer or tied)
    pub server_kept: usize,
}

impl MergeReport {
    /// Number of distinct ids in the merged output.
    pub fn total(&self) -> usize {
        self.server_only + self.local_only + self.local_wins + self.server_kept
    }

    /// Whether the merge changed anything relative to the server collection.
    pub fn server_changed(&self) -> bool {
        self.local_only > 0 || self.local_wins > 0
    }
}

/// Result of [`merge_with_report`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome<T> {
    /// Merged records, newest first
    pub records: Vec<T>,
    /// Per-id resolution counts
    pub report: MergeReport,
}

/// Merge server and local records, keeping the newest version of each id.
pub fn merge_items<T: Syncable>(server: Vec<T>, local: Vec<T>) -> Vec<T> {
    merge_with_report(server, local).records
}

/// Where the surviving version of an id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    ServerOnly,
    LocalOnly,
    LocalWins,
    ServerKept,
}

/// Merge server and local records and report how each id was resolved.
pub fn merge_with_report<T: Syncable>(server: Vec<T>, local: Vec<T>) -> MergeOutcome<T> {
    let mut by_id: BTreeMap<String, (T, Resolution)> = BTreeMap::new();

    for item in server {
        by_id.insert(item.id().to_string(), (item, Resolution::ServerOnly));
    }

    for item in local {
        match by_id.get_mut(item.id()) {
            None => {
                by_id.insert(item.id().to_string(), (item, Resolution::LocalOnly));
            }
            Some((existing, resolution)) => {
                if item.updated_at() > existing.updated_at() {
                    *existing = item;
                    if *resolution != Resolution::LocalOnly {
                        *resolution = Resolution::LocalWins;
                    }
                } else if *resolution == Resolution::ServerOnly {
                    *resolution = Resolution::ServerKept;
                }
            }
        }
    }

    let mut report = MergeReport::default();
    let mut records = Vec::with_capacity(by_id.len());
    for (_, (record, resolution)) in by_id {
        match resolution {
            Resolution::ServerOnly => report.server_only += 1,
            Resolution::LocalOnly => report.local_only += 1,
            Resolution::LocalWins => report.local_wins += 1,
            Resolution::ServerKept => report.server_kept += 1,
        }
        records.push(record);
    }

    // BTreeMap iteration is by id, so a stable sort leaves ties ordered by id.
    records.sort_by(|a, b| b.updated_at().cmp(&a.updated_at()));

    tracing::debug!(
        server_only = report.server_only,
        local_only = report.local_only,
        local_wins = report.local_wins,
        server_kept = report.server_kept,
        "merged collections"
    );

    MergeOutcome { records, report }
}

//! Once-per-session reconciliation with the server.
//!
//! ```text
//! Idle -> FetchingServer -> Merging -> Pushing -> Synced
//!               |                         |
//!               +--------> Offline <------+
//! ```
//!
//! The `has_synced` flag is raised before the first request goes out, so a
//! session that failed is not retried until [`SessionSync::reset`].

use crate::merge::{merge_with_report, MergeReport};
use crate::record::Record;
use crate::transport::{SyncTransport, TransportError};
use crate::PrincipalId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Authentication state of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Loading,
    Unauthenticated,
    Authenticated { principal: PrincipalId },
}

impl SessionStatus {
    pub fn authenticated(principal: impl Into<PrincipalId>) -> Self {
        SessionStatus::Authenticated {
            principal: principal.into(),
        }
    }

    pub fn principal(&self) -> Option<&str> {
        match self {
            SessionStatus::Authenticated { principal } if !principal.is_empty() => Some(principal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    FetchingServer,
    Merging,
    Pushing,
    Synced,
    /// The fetch or the push failed; local data stays authoritative.
    Offline,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::FetchingServer => "fetching-server",
            SyncPhase::Merging => "merging",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Synced => "synced",
            SyncPhase::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// What a completed merge produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub principal: PrincipalId,
    pub merge: MergeReport,
    /// Records handed to the hydrate callback and pushed upstream.
    pub merged: usize,
    /// Records the server reported as written.
    pub accepted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAuthenticated,
    AlreadySynced,
}

/// Result of [`SessionSync::run`]. Sync failures are reported here, never
/// raised.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced(SyncReport),
    Skipped(SkipReason),
    /// The server collection could not be fetched. Nothing was hydrated.
    Unavailable { error: TransportError },
    /// The merged collection was hydrated but the upload failed.
    PushFailed {
        report: SyncReport,
        error: TransportError,
    },
}

impl SyncOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Synced(_))
    }
}

/// Drives one fetch, merge, hydrate, push cycle per session.
#[derive(Debug)]
pub struct SessionSync<T> {
    transport: T,
    has_synced: AtomicBool,
    phase: Mutex<SyncPhase>,
}

impl<T: SyncTransport> SessionSync<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            has_synced: AtomicBool::new(false),
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn has_synced(&self) -> bool {
        self.has_synced.load(Ordering::Acquire)
    }

    /// Forget the previous session so the next `run` syncs again.
    pub fn reset(&self) {
        self.has_synced.store(false, Ordering::Release);
        self.set_phase(SyncPhase::Idle);
    }

    /// Reconcile `local` with the server for the given session.
    ///
    /// `hydrate` receives the merged collection before it is pushed. It is
    /// not called when the fetch fails.
    pub async fn run<F>(&self, session: &SessionStatus, local: Vec<Record>, hydrate: F) -> SyncOutcome
    where
        F: FnOnce(&[Record]),
    {
        let Some(principal) = session.principal() else {
            return SyncOutcome::Skipped(SkipReason::NotAuthenticated);
        };
        if self
            .has_synced
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(principal, "session already synced");
            return SyncOutcome::Skipped(SkipReason::AlreadySynced);
        }

        self.set_phase(SyncPhase::FetchingServer);
        let server = match self.transport.fetch_items().await {
            Ok(items) => items,
            Err(error) => {
                warn!(principal, error = %error, "sync unavailable, keeping local data");
                self.set_phase(SyncPhase::Offline);
                return SyncOutcome::Unavailable { error };
            }
        };

        self.set_phase(SyncPhase::Merging);
        let outcome = merge_with_report(server, local);
        hydrate(&outcome.records);

        let mut report = SyncReport {
            principal: principal.to_string(),
            merge: outcome.report,
            merged: outcome.records.len(),
            accepted: 0,
        };

        self.set_phase(SyncPhase::Pushing);
        match self.transport.push_items(&outcome.records).await {
            Ok(receipt) => {
                report.accepted = receipt.synced;
                self.set_phase(SyncPhase::Synced);
                info!(
                    principal,
                    merged = report.merged,
                    accepted = report.accepted,
                    "session synced"
                );
                SyncOutcome::Synced(report)
            }
            Err(error) => {
                warn!(principal, error = %error, "failed to push merged items");
                self.set_phase(SyncPhase::Offline);
                SyncOutcome::PushFailed { report, error }
            }
        }
    }

    fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.lock();
        if *current != phase {
            debug!(from = %*current, to = %phase, "sync phase");
            *current = phase;
        }
    }
}

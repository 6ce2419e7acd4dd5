//! Edit coordinators: one serialized mutation path per spreadsheet.
//!
//! Connection threads cannot touch rows directly. They send a
//! `CoordinatorRequest` through an mpsc channel to the spreadsheet's
//! coordinator thread, which validates, version-checks, persists (row +
//! audit entry in one transaction), broadcasts, and replies through a
//! oneshot channel.
//!
//! This single point of serialization per spreadsheet is what provides the
//! ordering and lost-update guarantees: mutations for one spreadsheet are
//! processed strictly one at a time, while different spreadsheets proceed
//! fully in parallel on their own threads and their own SQLite connections.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use dealgrid_core::{apply_delta, validate_row, FieldError, MutationAction, Row, RowData};
use dealgrid_store::{Store, StoreError};

use crate::metrics::ServerMetrics;
use crate::registry::ConnectionRegistry;

/// A simple oneshot channel for single-use replies.
/// Uses std::sync::mpsc under the hood.
pub mod oneshot {
    use std::sync::mpsc;

    pub struct Sender<T>(mpsc::SyncSender<T>);
    pub struct Receiver<T>(mpsc::Receiver<T>);

    impl<T> Sender<T> {
        pub fn send(self, value: T) -> Result<(), T> {
            self.0.send(value).map_err(|e| e.0)
        }
    }

    impl<T> Receiver<T> {
        pub fn blocking_recv(self) -> Result<T, RecvError> {
            self.0.recv().map_err(|_| RecvError)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct RecvError;

    pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
        // Buffer of 1 for oneshot semantics
        let (tx, rx) = mpsc::sync_channel(1);
        (Sender(tx), Receiver(rx))
    }
}

/// A row mutation request, already permission-checked by the gateway.
#[derive(Debug, Clone)]
pub struct MutateRequest {
    pub row_id: Uuid,
    /// Version the client believes is current. `0` means the row must not
    /// yet exist.
    pub expected_version: u64,
    /// `None` deletes the row. Otherwise a delta merged onto the current
    /// payload (`null` values clear fields).
    pub delta: Option<RowData>,
    pub actor: Uuid,
}

/// A durably committed mutation, handed to the broadcast fanout.
#[derive(Debug, Clone)]
pub struct CommittedMutation {
    pub spreadsheet_id: Uuid,
    pub row_id: Uuid,
    pub action: MutationAction,
    /// Row version after the commit.
    pub version: u64,
    /// Committed payload. Empty for deletes.
    pub row_data: RowData,
    pub actor: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Why the coordinator refused a mutation. Nothing was persisted.
#[derive(Debug, Clone)]
pub enum MutationReject {
    /// Schema validation failed; the client must correct its input.
    Validation(Vec<FieldError>),
    /// Stale `expected_version`. Carries current state so the client can
    /// refetch-free retry.
    Conflict {
        /// `0` when the row does not exist.
        current_version: u64,
        current_row_data: Option<RowData>,
    },
    /// Storage failed during the commit. Retryable.
    Persistence(String),
}

pub type MutationOutcome = Result<CommittedMutation, MutationReject>;

/// Requests from connection threads to a coordinator.
enum CoordinatorRequest {
    Mutate {
        req: MutateRequest,
        reply: oneshot::Sender<MutationOutcome>,
    },
}

/// Error talking to a coordinator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The coordinator thread is gone.
    ChannelClosed,
}

/// Handle for submitting mutations to one spreadsheet's coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorRequest>,
}

impl CoordinatorHandle {
    /// Submit a mutation and wait for the outcome.
    ///
    /// On `Ok(Ok(_))` the mutation is durably committed and already handed
    /// to the fanout; the originator learns of it through the broadcast like
    /// every other joined session.
    pub fn mutate(&self, req: MutateRequest) -> Result<MutationOutcome, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorRequest::Mutate {
                req,
                reply: reply_tx,
            })
            .map_err(|_| CoordinatorError::ChannelClosed)?;
        reply_rx
            .blocking_recv()
            .map_err(|_| CoordinatorError::ChannelClosed)
    }
}

/// Lazily spawns and caches one coordinator per spreadsheet.
///
/// Each coordinator owns its own SQLite connection against the shared
/// database file, so commits on different spreadsheets don't serialize
/// in-process. Coordinator threads exit when the pool (and every handle)
/// is dropped.
pub struct CoordinatorPool {
    db_path: PathBuf,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
    inner: Mutex<HashMap<Uuid, CoordinatorHandle>>,
}

impl CoordinatorPool {
    pub fn new(db_path: PathBuf, registry: ConnectionRegistry, metrics: ServerMetrics) -> Self {
        Self {
            db_path,
            registry,
            metrics,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Get (spawning if needed) the coordinator for a spreadsheet.
    pub fn handle(&self, spreadsheet_id: Uuid) -> Result<CoordinatorHandle, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.get(&spreadsheet_id) {
            return Ok(handle.clone());
        }

        let store = Store::open(&self.db_path)?;
        let (tx, rx) = mpsc::channel();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        thread::spawn(move || run_coordinator(spreadsheet_id, store, registry, metrics, rx));

        let handle = CoordinatorHandle { tx };
        inner.insert(spreadsheet_id, handle.clone());
        Ok(handle)
    }
}

fn run_coordinator(
    spreadsheet_id: Uuid,
    mut store: Store,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
    rx: mpsc::Receiver<CoordinatorRequest>,
) {
    log::debug!("Coordinator started for spreadsheet {}", spreadsheet_id);
    while let Ok(CoordinatorRequest::Mutate { req, reply }) = rx.recv() {
        let outcome = process_mutation(&mut store, spreadsheet_id, &req);
        match &outcome {
            Ok(commit) => {
                ServerMetrics::bump(&metrics.committed_mutations);
                // Broadcast only after the durable commit, from this thread,
                // so fanout order equals commit order.
                registry.broadcast(commit);
            }
            Err(MutationReject::Validation(_)) => {
                ServerMetrics::bump(&metrics.validation_rejections);
            }
            Err(MutationReject::Conflict { .. }) => {
                ServerMetrics::bump(&metrics.conflict_rejections);
            }
            Err(MutationReject::Persistence(_)) => {
                ServerMetrics::bump(&metrics.persistence_failures);
            }
        }
        // Originator may have disconnected mid-mutation; the commit stands
        let _ = reply.send(outcome);
    }
    log::debug!("Coordinator for spreadsheet {} shutting down", spreadsheet_id);
}

/// Validate, version-check, and persist one mutation.
///
/// Runs on the coordinator thread, so reads and the commit cannot interleave
/// with another mutation on this spreadsheet. Column definitions are read
/// here as well, giving each mutation a stable schema snapshot.
fn process_mutation(
    store: &mut Store,
    spreadsheet_id: Uuid,
    req: &MutateRequest,
) -> MutationOutcome {
    let columns = store
        .list_columns(spreadsheet_id)
        .map_err(|e| persistence_reject("loading columns", &e))?;
    let current = store
        .get_row(spreadsheet_id, req.row_id)
        .map_err(|e| persistence_reject("loading row", &e))?;

    let now = Utc::now();

    match current {
        None => {
            if req.expected_version != 0 {
                // Client expects a row that does not exist (deleted or never
                // created); report version 0 so it knows to recreate.
                return Err(MutationReject::Conflict {
                    current_version: 0,
                    current_row_data: None,
                });
            }
            let Some(delta) = &req.delta else {
                // Deleting a nonexistent row
                return Err(MutationReject::Conflict {
                    current_version: 0,
                    current_row_data: None,
                });
            };
            let candidate = apply_delta(&RowData::new(), delta);
            let normalized =
                validate_row(&columns, &candidate).map_err(MutationReject::Validation)?;
            let position = store
                .next_row_position(spreadsheet_id)
                .map_err(|e| persistence_reject("allocating position", &e))?;
            let row = Row {
                id: req.row_id,
                spreadsheet_id,
                position,
                row_data: normalized,
                version: 1,
                updated_by: req.actor,
                updated_at: now,
            };
            store
                .commit_row_mutation(MutationAction::Insert, Some(&row), None, req.actor, now)
                .map_err(|e| persistence_reject("committing insert", &e))?;
            Ok(CommittedMutation {
                spreadsheet_id,
                row_id: req.row_id,
                action: MutationAction::Insert,
                version: row.version,
                row_data: row.row_data,
                actor: req.actor,
                timestamp: now,
            })
        }
        Some(row) => {
            if req.expected_version != row.version {
                return Err(MutationReject::Conflict {
                    current_version: row.version,
                    current_row_data: Some(row.row_data),
                });
            }
            match &req.delta {
                Some(delta) => {
                    let candidate = apply_delta(&row.row_data, delta);
                    let normalized =
                        validate_row(&columns, &candidate).map_err(MutationReject::Validation)?;
                    let updated = Row {
                        row_data: normalized,
                        version: row.version + 1,
                        updated_by: req.actor,
                        updated_at: now,
                        ..row.clone()
                    };
                    store
                        .commit_row_mutation(
                            MutationAction::Update,
                            Some(&updated),
                            Some(&row),
                            req.actor,
                            now,
                        )
                        .map_err(|e| persistence_reject("committing update", &e))?;
                    Ok(CommittedMutation {
                        spreadsheet_id,
                        row_id: req.row_id,
                        action: MutationAction::Update,
                        version: updated.version,
                        row_data: updated.row_data,
                        actor: req.actor,
                        timestamp: now,
                    })
                }
                None => {
                    store
                        .commit_row_mutation(
                            MutationAction::Delete,
                            None,
                            Some(&row),
                            req.actor,
                            now,
                        )
                        .map_err(|e| persistence_reject("committing delete", &e))?;
                    Ok(CommittedMutation {
                        spreadsheet_id,
                        row_id: req.row_id,
                        action: MutationAction::Delete,
                        // The deleted row's version is still consumed
                        version: row.version + 1,
                        row_data: RowData::new(),
                        actor: req.actor,
                        timestamp: now,
                    })
                }
            }
        }
    }
}

fn persistence_reject(stage: &str, err: &StoreError) -> MutationReject {
    match err {
        // The row write succeeded but the audit append did not: the
        // transaction rolled back, and the audit invariant held only because
        // it did. This must reach operators, not just the client.
        StoreError::AuditWrite(_) => {
            log::error!("AUDIT WRITE FAILURE while {}: {}", stage, err);
        }
        _ => {
            log::warn!("Persistence failure while {}: {}", stage, err);
        }
    }
    MutationReject::Persistence(err.to_string())
}

//! Session-scoped request/response store.
//!
//! A [`Session`] copies a row out of the committed state only when it first
//! touches it, remembering the row's version at that moment. [`Session::commit`]
//! checks that none of those rows changed underneath it, then publishes every
//! touched row at once; on a stale version the whole commit is refused with
//! [`StoreError::Conflict`]. Dropping a session without committing discards
//! its changes.
//!
//! Pending requests are indexed per type, so a session never walks processed
//! history. With a journal path, every commit appends one JSON line holding
//! just the rows it changed; opening the store replays the journal and rewrites
//! it as a single compacted line.

use crate::mappings::RequestType;
use crate::models::{Cbsd, Grant, Request, RequestState, Response, RowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,

    #[error("unknown request {0}")]
    UnknownRequest(RowId),

    #[error("row {0} was changed by a concurrent session")]
    Conflict(RowId),

    #[error("failed to read journal {}", path.display())]
    ReadJournal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode journal {} at line {line}", path.display())]
    DecodeJournal {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write journal {}: {reason}", path.display())]
    WriteJournal { path: PathBuf, reason: String },
}

/// Committed rows. Ids are unique across all four tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub requests: BTreeMap<RowId, Request>,
    pub responses: BTreeMap<RowId, Response>,
    pub cbsds: BTreeMap<RowId, Cbsd>,
    pub grants: BTreeMap<RowId, Grant>,
    pending: BTreeMap<RequestType, BTreeSet<(DateTime<Utc>, RowId)>>,
    responses_by_request: BTreeMap<RowId, Vec<RowId>>,
    versions: HashMap<RowId, u64>,
}

impl StoreState {
    fn max_id(&self) -> RowId {
        [
            self.requests.keys().next_back(),
            self.responses.keys().next_back(),
            self.cbsds.keys().next_back(),
            self.grants.keys().next_back(),
        ]
        .into_iter()
        .flatten()
        .copied()
        .max()
        .unwrap_or(0)
    }

    pub fn responses_for(&self, request_id: RowId) -> Vec<&Response> {
        self.responses_by_request
            .get(&request_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.responses.get(id))
            .collect()
    }

    pub fn pending_count(&self, request_type: RequestType) -> usize {
        self.pending.get(&request_type).map_or(0, BTreeSet::len)
    }

    fn version(&self, id: RowId) -> u64 {
        self.versions.get(&id).copied().unwrap_or(0)
    }

    fn bump(&mut self, id: RowId) {
        *self.versions.entry(id).or_insert(0) += 1;
    }

    fn apply(&mut self, changes: ChangeSet) {
        for request in changes.requests {
            let id = request.id;
            if let Some(old) = self.requests.get(&id) {
                if let Some(index) = self.pending.get_mut(&old.request_type) {
                    index.remove(&(old.created_at, id));
                }
            }
            if request.is_pending() {
                self.pending
                    .entry(request.request_type)
                    .or_default()
                    .insert((request.created_at, id));
            }
            self.bump(id);
            self.requests.insert(id, request);
        }
        for response in changes.responses {
            let ids = self.responses_by_request.entry(response.request_id).or_default();
            if !ids.contains(&response.id) {
                ids.push(response.id);
            }
            self.bump(response.id);
            self.responses.insert(response.id, response);
        }
        for cbsd in changes.cbsds {
            self.bump(cbsd.id);
            self.cbsds.insert(cbsd.id, cbsd);
        }
        for grant in changes.grants {
            self.bump(grant.id);
            self.grants.insert(grant.id, grant);
        }
        for id in changes.removed_grants {
            self.bump(id);
            self.grants.remove(&id);
        }
    }
}

/// Rows written by one commit; also the journal line format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChangeSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    requests: Vec<Request>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    responses: Vec<Response>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cbsds: Vec<Cbsd>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    grants: Vec<Grant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    removed_grants: Vec<RowId>,
}

impl ChangeSet {
    fn from_state(state: &StoreState) -> Self {
        Self {
            requests: state.requests.values().cloned().collect(),
            responses: state.responses.values().cloned().collect(),
            cbsds: state.cbsds.values().cloned().collect(),
            grants: state.grants.values().cloned().collect(),
            removed_grants: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.requests.len() + self.responses.len() + self.cbsds.len() + self.grants.len() + self.removed_grants.len()
    }
}

struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    /// Replays `path` into a fresh state. A torn final line from an interrupted append is skipped.
    fn replay(path: &Path) -> Result<StoreState, StoreError> {
        let read_err = |source| StoreError::ReadJournal {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(read_err)?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut state = StoreState::default();
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeSet>(line) {
                Ok(changes) => state.apply(changes),
                Err(e) if Some(n) == last => {
                    warn!("Ignoring torn journal entry at {}:{}: {}", path.display(), n + 1, e);
                }
                Err(source) => {
                    return Err(StoreError::DecodeJournal {
                        path: path.to_path_buf(),
                        line: n + 1,
                        source,
                    })
                }
            }
        }
        Ok(state)
    }

    /// Rewrites the journal as one line holding `state`, then opens it for appending.
    fn compact(path: &Path, state: &StoreState) -> Result<Self, StoreError> {
        let fail = |reason: String| StoreError::WriteJournal {
            path: path.to_path_buf(),
            reason,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| fail(e.to_string()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, &ChangeSet::from_state(state)).map_err(|e| fail(e.to_string()))?;
            writer.write_all(b"\n").map_err(|e| fail(e.to_string()))?;
            writer.flush().map_err(|e| fail(e.to_string()))?;
        }
        tmp.as_file().sync_all().map_err(|e| fail(e.to_string()))?;
        tmp.persist(path).map_err(|e| fail(e.to_string()))?;

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| fail(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn append(&mut self, changes: &ChangeSet) -> Result<(), StoreError> {
        let fail = |reason: String| StoreError::WriteJournal {
            path: self.path.clone(),
            reason,
        };
        serde_json::to_writer(&mut self.writer, changes).map_err(|e| fail(e.to_string()))?;
        self.writer.write_all(b"\n").map_err(|e| fail(e.to_string()))?;
        self.writer.flush().map_err(|e| fail(e.to_string()))?;
        self.writer.get_ref().sync_data().map_err(|e| fail(e.to_string()))?;
        Ok(())
    }
}

struct Inner {
    state: StoreState,
    journal: Option<Journal>,
}

pub struct Store {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: StoreState::default(),
                journal: None,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a store backed by a JSON-lines journal, replaying it if it exists.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let state = if path.exists() {
            let state = Journal::replay(path)?;
            info!(
                "Loaded store journal {} ({} requests, {} pending registrations, {} cbsds)",
                path.display(),
                state.requests.len(),
                state.pending_count(RequestType::Registration),
                state.cbsds.len()
            );
            state
        } else {
            StoreState::default()
        };
        let journal = Journal::compact(path, &state)?;

        Ok(Self {
            next_id: AtomicU64::new(state.max_id() + 1),
            inner: RwLock::new(Inner {
                state,
                journal: Some(journal),
            }),
        })
    }

    /// Starts a unit of work. Nothing is copied until the session touches a row.
    pub fn session(&self) -> Result<Session<'_>, StoreError> {
        if self.inner.is_poisoned() {
            return Err(StoreError::Poisoned);
        }
        Ok(Session {
            store: self,
            requests: BTreeMap::new(),
            responses: BTreeMap::new(),
            cbsds: BTreeMap::new(),
            grants: BTreeMap::new(),
            base_versions: HashMap::new(),
            committed: false,
        })
    }

    /// Full copy of the committed state.
    pub fn snapshot(&self) -> Result<StoreState, StoreError> {
        Ok(self.inner.read().map_err(|_| StoreError::Poisoned)?.state.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> RowId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Transactional unit of work. Commit-or-rollback: anything not committed is dropped.
pub struct Session<'a> {
    store: &'a Store,
    requests: BTreeMap<RowId, Request>,
    responses: BTreeMap<RowId, Response>,
    cbsds: BTreeMap<RowId, Cbsd>,
    /// `None` marks a removed grant.
    grants: BTreeMap<RowId, Option<Grant>>,
    /// Committed version of every row copied in, as of the copy.
    base_versions: HashMap<RowId, u64>,
    committed: bool,
}

impl<'a> Session<'a> {
    /// Rows copied into or created by this session.
    pub fn touched_rows(&self) -> usize {
        self.requests.len() + self.responses.len() + self.cbsds.len() + self.grants.len()
    }

    // --- requests ---

    /// Pending requests of one type, oldest first, at most `limit`.
    pub fn pending_requests(&self, request_type: RequestType, limit: usize) -> Vec<Request> {
        let inner = self.store.read();
        let mut pending = Vec::new();
        if let Some(index) = inner.state.pending.get(&request_type) {
            for (_, id) in index {
                if pending.len() == limit {
                    break;
                }
                match self.requests.get(id) {
                    Some(local) if local.is_pending() => pending.push(local.clone()),
                    Some(_) => {}
                    None => pending.extend(inner.state.requests.get(id).cloned()),
                }
            }
        }
        pending.extend(
            self.requests
                .values()
                .filter(|r| {
                    r.request_type == request_type && r.is_pending() && !inner.state.requests.contains_key(&r.id)
                })
                .cloned(),
        );
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        pending
    }

    pub fn request(&self, id: RowId) -> Option<Request> {
        match self.requests.get(&id) {
            Some(local) => Some(local.clone()),
            None => self.store.read().state.requests.get(&id).cloned(),
        }
    }

    pub fn insert_request(&mut self, request_type: RequestType, cbsd: RowId, payload: Value) -> RowId {
        let id = self.store.allocate_id();
        self.requests.insert(
            id,
            Request {
                id,
                request_type,
                cbsd,
                payload,
                state: RequestState::Pending,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn mark_processed(&mut self, id: RowId) -> Result<(), StoreError> {
        if !self.requests.contains_key(&id) {
            let store = self.store;
            let inner = store.read();
            let row = inner
                .state
                .requests
                .get(&id)
                .cloned()
                .ok_or(StoreError::UnknownRequest(id))?;
            self.base_versions.insert(id, inner.state.version(id));
            self.requests.insert(id, row);
        }
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Processed;
        }
        Ok(())
    }

    // --- responses ---

    pub fn insert_response(&mut self, request_id: RowId, response_code: Option<i64>, payload: Value) -> RowId {
        let id = self.store.allocate_id();
        self.responses.insert(
            id,
            Response {
                id,
                request_id,
                response_code,
                payload,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn responses_for(&self, request_id: RowId) -> Vec<Response> {
        let inner = self.store.read();
        let mut responses: Vec<Response> = inner.state.responses_for(request_id).into_iter().cloned().collect();
        responses.extend(self.responses.values().filter(|r| r.request_id == request_id).cloned());
        responses
    }

    // --- cbsds ---

    pub fn cbsd(&self, id: RowId) -> Option<Cbsd> {
        match self.cbsds.get(&id) {
            Some(local) => Some(local.clone()),
            None => self.store.read().state.cbsds.get(&id).cloned(),
        }
    }

    pub fn cbsd_mut(&mut self, id: RowId) -> Option<&mut Cbsd> {
        if !self.cbsds.contains_key(&id) {
            let store = self.store;
            let inner = store.read();
            let row = inner.state.cbsds.get(&id)?.clone();
            self.base_versions.insert(id, inner.state.version(id));
            self.cbsds.insert(id, row);
        }
        self.cbsds.get_mut(&id)
    }

    pub fn insert_cbsd(&mut self, mut cbsd: Cbsd) -> RowId {
        let id = self.store.allocate_id();
        cbsd.id = id;
        self.cbsds.insert(id, cbsd);
        id
    }

    fn find_cbsd(&self, matches: impl Fn(&Cbsd) -> bool) -> Option<RowId> {
        let inner = self.store.read();
        let local = self.cbsds.values().filter(|c| matches(*c)).map(|c| c.id);
        let committed = inner
            .state
            .cbsds
            .values()
            .filter(|c| !self.cbsds.contains_key(&c.id) && matches(*c))
            .map(|c| c.id);
        local.chain(committed).min()
    }

    pub fn find_cbsd_by_cbsd_id(&self, cbsd_id: &str) -> Option<RowId> {
        self.find_cbsd(|c| c.cbsd_id.as_deref() == Some(cbsd_id))
    }

    pub fn find_cbsd_by_serial(&self, fcc_id: &str, serial_number: &str) -> Option<RowId> {
        self.find_cbsd(|c| {
            c.fcc_id.as_deref() == Some(fcc_id) && c.cbsd_serial_number.as_deref() == Some(serial_number)
        })
    }

    // --- grants ---

    pub fn grants_for(&self, cbsd: RowId) -> Vec<Grant> {
        let inner = self.store.read();
        let mut grants: Vec<Grant> = inner
            .state
            .grants
            .values()
            .filter(|g| g.cbsd == cbsd && !self.grants.contains_key(&g.id))
            .cloned()
            .collect();
        grants.extend(self.grants.values().flatten().filter(|g| g.cbsd == cbsd).cloned());
        grants.sort_by_key(|g| g.id);
        grants
    }

    pub fn find_grant(&self, cbsd: RowId, grant_id: &str) -> Option<RowId> {
        self.grants_for(cbsd)
            .into_iter()
            .find(|g| g.grant_id == grant_id)
            .map(|g| g.id)
    }

    pub fn grant(&self, id: RowId) -> Option<Grant> {
        match self.grants.get(&id) {
            Some(local) => local.clone(),
            None => self.store.read().state.grants.get(&id).cloned(),
        }
    }

    pub fn grant_mut(&mut self, id: RowId) -> Option<&mut Grant> {
        if !self.grants.contains_key(&id) {
            let store = self.store;
            let inner = store.read();
            let row = inner.state.grants.get(&id)?.clone();
            self.base_versions.insert(id, inner.state.version(id));
            self.grants.insert(id, Some(row));
        }
        self.grants.get_mut(&id)?.as_mut()
    }

    pub fn insert_grant(&mut self, mut grant: Grant) -> RowId {
        let id = self.store.allocate_id();
        grant.id = id;
        self.grants.insert(id, Some(grant));
        id
    }

    pub fn remove_grant(&mut self, id: RowId) -> Option<Grant> {
        let removed = self.grant_mut(id)?.clone();
        if self.base_versions.contains_key(&id) {
            self.grants.insert(id, None);
        } else {
            // Created in this session, nothing committed to remove.
            self.grants.remove(&id);
        }
        Some(removed)
    }

    /// Publishes every row this session touched, or none of them if another
    /// commit changed one of those rows after this session copied it.
    pub fn commit(mut self) -> Result<(), StoreError> {
        if self.touched_rows() == 0 {
            self.committed = true;
            return Ok(());
        }

        let store = self.store;
        let mut inner = store.inner.write().map_err(|_| StoreError::Poisoned)?;
        let stale = self
            .base_versions
            .iter()
            .find(|&(id, base)| inner.state.version(*id) != *base)
            .map(|(id, _)| *id);
        if let Some(id) = stale {
            return Err(StoreError::Conflict(id));
        }

        let mut changes = ChangeSet {
            requests: std::mem::take(&mut self.requests).into_values().collect(),
            responses: std::mem::take(&mut self.responses).into_values().collect(),
            cbsds: std::mem::take(&mut self.cbsds).into_values().collect(),
            ..ChangeSet::default()
        };
        for (id, grant) in std::mem::take(&mut self.grants) {
            match grant {
                Some(grant) => changes.grants.push(grant),
                None => changes.removed_grants.push(id),
            }
        }

        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&changes)?;
        }
        let rows = changes.len();
        inner.state.apply(changes);
        self.committed = true;
        debug!("Committed session ({} rows)", rows);
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if !self.committed && self.touched_rows() > 0 {
            debug!("Rolled back session ({} rows touched)", self.touched_rows());
        }
    }
}

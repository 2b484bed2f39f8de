//! Durable, ordered queue of records awaiting delivery.

use super::journal::{Journal, JournalEntry, Replay};
use crate::error::StorageError;
use crate::record::{LogRecord, RecordDraft};
use crate::types::RecordId;
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, StorageError>;

/// Dead journal entries tolerated before the journal is rewritten.
const COMPACT_MIN_DEAD_ENTRIES: u64 = 1024;

/// In-memory index over the journal. Records stay on disk; each entry maps
/// an id to the offset of its `Enqueue` frame.
struct QueueState {
    journal: Journal,
    pending: BTreeMap<RecordId, u64>,
    leased: BTreeMap<RecordId, u64>,
    next_id: RecordId,
    /// Set when an append failed part way; the journal tail may hold a
    /// partial frame and must be rewritten before the next append.
    needs_rewrite: bool,
}

/// Index built while the journal is replayed.
#[derive(Default)]
struct ReplayIndex {
    pending: BTreeMap<RecordId, u64>,
    leased: BTreeMap<RecordId, u64>,
    next_id: Option<RecordId>,
}

impl ReplayIndex {
    fn apply(&mut self, offset: u64, entry: JournalEntry) {
        match entry {
            JournalEntry::Checkpoint { next_id } => {
                self.bump(next_id);
            }
            JournalEntry::Enqueue { id, .. } => {
                self.pending.insert(id, offset);
                self.bump(id.next());
            }
            JournalEntry::Lease { ids } => {
                for id in ids {
                    if let Some(at) = self.pending.remove(&id) {
                        self.leased.insert(id, at);
                    }
                }
            }
            JournalEntry::Release { ids } => {
                for id in ids {
                    if let Some(at) = self.leased.remove(&id) {
                        self.pending.insert(id, at);
                    }
                }
            }
            JournalEntry::Remove { ids } => {
                for id in ids {
                    self.pending.remove(&id);
                    self.leased.remove(&id);
                }
            }
        }
    }

    fn bump(&mut self, id: RecordId) {
        self.next_id = Some(self.next_id.map_or(id, |next| next.max(id)));
    }
}

impl QueueState {
    fn from_replay(journal: Journal, index: ReplayIndex, replay: &Replay) -> Self {
        Self {
            journal,
            pending: index.pending,
            leased: index.leased,
            next_id: index.next_id.unwrap_or(RecordId(1)),
            needs_rewrite: replay.discarded_bytes > 0,
        }
    }

    fn live_count(&self) -> u64 {
        (self.pending.len() + self.leased.len()) as u64
    }

    fn should_compact(&self) -> bool {
        let dead = self.journal.entry_count().saturating_sub(self.live_count() + 1);
        dead > COMPACT_MIN_DEAD_ENTRIES && dead > self.live_count()
    }

    /// Rewrite the journal so it holds exactly the live state.
    ///
    /// Records are copied frame by frame from the old journal; the index is
    /// only updated once the new file is in place.
    fn compact(&mut self) -> Result<()> {
        let mut live: Vec<(RecordId, u64)> = self
            .pending
            .iter()
            .chain(self.leased.iter())
            .map(|(id, at)| (*id, *at))
            .collect();
        live.sort_unstable_by_key(|(id, _)| *id);

        let mut rewrite = self.journal.begin_rewrite()?;
        rewrite.push(&JournalEntry::Checkpoint {
            next_id: self.next_id,
        })?;
        let mut moved = BTreeMap::new();
        for (id, at) in live {
            let entry = self.journal.read_at(at)?;
            moved.insert(id, rewrite.push(&entry)?);
        }
        if !self.leased.is_empty() {
            rewrite.push(&JournalEntry::Lease {
                ids: self.leased.keys().copied().collect(),
            })?;
        }

        let before = self.journal.entry_count();
        self.journal.commit_rewrite(rewrite)?;
        for (id, at) in self.pending.iter_mut().chain(self.leased.iter_mut()) {
            if let Some(new_at) = moved.get(id) {
                *at = *new_at;
            }
        }
        self.needs_rewrite = false;
        debug!(before, after = self.journal.entry_count(), "compacted queue journal");
        Ok(())
    }

    /// Append to the journal, rewriting first if a previous append failed.
    fn append(&mut self, entry: &JournalEntry) -> Result<u64> {
        if self.needs_rewrite {
            self.compact()?;
        }
        match self.journal.append(entry) {
            Ok(at) => Ok(at),
            Err(e) => {
                self.needs_rewrite = true;
                Err(e)
            }
        }
    }
}

/// Persistent queue store.
///
/// Records move through two states, `pending` and `leased`, until they are
/// removed. Ids are assigned here and define delivery order. Every mutation
/// is fsynced before the call returns.
///
/// A single file at `path` holds the queue; `<path>.lock` guards it against
/// a second process.
pub struct QueueStore {
    path: PathBuf,

    /// Lock file for exclusive access. `None` once closed.
    lock_file: Mutex<Option<File>>,

    /// `None` once closed.
    state: Mutex<Option<QueueState>>,
}

impl QueueStore {
    /// Open or create the queue at `path`.
    ///
    /// Records left leased by a previous session are returned to pending
    /// before this returns.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&path)?;
        let mut index = ReplayIndex::default();
        let (journal, replay) = Journal::open(&path, |offset, entry| {
            index.apply(offset, entry);
            Ok(())
        })?;

        if replay.discarded_bytes > 0 {
            warn!(
                path = %path.display(),
                discarded_bytes = replay.discarded_bytes,
                "discarding incomplete journal tail"
            );
        }

        let mut state = QueueState::from_replay(journal, index, &replay);

        // Recovery: nothing can be leased before the first flush of this session
        let recovered: Vec<RecordId> = state.leased.keys().copied().collect();
        if !recovered.is_empty() {
            let leased = std::mem::take(&mut state.leased);
            state.pending.extend(leased);
            info!(
                path = %path.display(),
                recovered = recovered.len(),
                "returned records leased by a previous session to pending"
            );
        }

        if state.needs_rewrite || state.should_compact() {
            state.compact()?;
        } else if !recovered.is_empty() {
            state.append(&JournalEntry::Release { ids: recovered })?;
        }

        debug!(
            path = %path.display(),
            pending = state.pending.len(),
            next_id = %state.next_id,
            "opened queue store"
        );

        Ok(Self {
            path,
            lock_file: Mutex::new(Some(lock_file)),
            state: Mutex::new(Some(state)),
        })
    }

    /// Persist a record and return its id.
    ///
    /// The write is on disk when this returns. On error the record was not
    /// logged and its id is not consumed.
    pub fn enqueue(&self, draft: RecordDraft) -> Result<RecordId> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(StorageError::Closed)?;

        let id = state.next_id;
        let record = draft.into_record(id);
        let at = state.append(&JournalEntry::enqueue(&record)?)?;

        state.next_id = id.next();
        state.pending.insert(id, at);
        Ok(id)
    }

    /// Lease up to `max_n` of the oldest pending records, in id order.
    ///
    /// Only one lease may be outstanding at a time.
    pub fn lease_batch(&self, max_n: usize) -> Result<Vec<LogRecord>> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(StorageError::Closed)?;

        if !state.leased.is_empty() {
            return Err(StorageError::LeaseOutstanding(state.leased.len()));
        }

        let claimed: Vec<(RecordId, u64)> = state
            .pending
            .iter()
            .take(max_n)
            .map(|(id, at)| (*id, *at))
            .collect();
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        // Read before journaling so a bad frame leaves nothing leased
        let batch = claimed
            .iter()
            .map(|(_, at)| state.journal.read_record(*at))
            .collect::<Result<Vec<_>>>()?;

        state.append(&JournalEntry::Lease {
            ids: claimed.iter().map(|(id, _)| *id).collect(),
        })?;

        for (id, at) in claimed {
            state.pending.remove(&id);
            state.leased.insert(id, at);
        }
        Ok(batch)
    }

    /// Permanently delete records. Unknown ids are ignored.
    ///
    /// Returns how many records were deleted.
    pub fn remove(&self, ids: &[RecordId]) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(StorageError::Closed)?;

        let present: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| state.leased.contains_key(id) || state.pending.contains_key(id))
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        state.append(&JournalEntry::Remove {
            ids: present.clone(),
        })?;

        for id in &present {
            state.leased.remove(id);
            state.pending.remove(id);
        }

        if state.should_compact() {
            // The removal is already durable; a failed rewrite is retried on
            // the next append.
            if let Err(e) = state.compact() {
                warn!(error = %e, "queue journal compaction failed");
                state.needs_rewrite = true;
            }
        }

        Ok(present.len())
    }

    /// Return leased records to pending. Ids not currently leased are ignored.
    ///
    /// Returns how many records were released.
    pub fn release_lease(&self, ids: &[RecordId]) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(StorageError::Closed)?;

        let leased: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| state.leased.contains_key(id))
            .collect();
        if leased.is_empty() {
            return Ok(0);
        }

        state.append(&JournalEntry::Release {
            ids: leased.clone(),
        })?;

        for id in &leased {
            if let Some(at) = state.leased.remove(id) {
                state.pending.insert(*id, at);
            }
        }
        Ok(leased.len())
    }

    /// Number of records in the `pending` state.
    pub fn count_pending(&self) -> Result<usize> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(state.pending.len())
    }

    /// Number of records claimed by an in-progress flush.
    pub fn count_leased(&self) -> Result<usize> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(state.leased.len())
    }

    /// Ids of the outstanding lease, if any.
    pub fn leased_ids(&self) -> Result<Vec<RecordId>> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(state.leased.keys().copied().collect())
    }

    /// Total records held, pending or leased.
    pub fn len(&self) -> Result<usize> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(state.pending.len() + state.leased.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy up to `limit` of the oldest pending records without leasing them.
    pub fn peek(&self, limit: usize) -> Result<Vec<LogRecord>> {
        let guard = self.state.lock();
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        state
            .pending
            .values()
            .take(limit)
            .map(|at| state.journal.read_record(*at))
            .collect()
    }

    /// Release the file handle and the process lock. Idempotent.
    ///
    /// Outstanding leases are not released; they are recovered on the next
    /// open.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.take().is_some() {
            debug!(path = %self.path.display(), "closed queue store");
        }
        if let Some(file) = self.lock_file.lock().take() {
            let _ = file.unlock();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Get the queue file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(lock_path(path))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        Ok(lock_file)
    }
}

/// `<path>.lock`, next to the queue file.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

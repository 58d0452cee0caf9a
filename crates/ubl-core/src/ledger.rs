//! Per-shard ledger coordinator.
//!
//! The sole writer for a `(tenant, shard)` pair. Owns the sequence counter,
//! the chained head hash, a bounded hot window of recent atoms, and a
//! content-id dedup window. Appends are strictly serial per coordinator; the
//! runtime guarantees one instance per key.
//!
//! # Chain invariants
//!
//! - Sequence numbers are dense and start at 1.
//! - `head_N = sha256(head_{N-1} ∥ ":" ∥ cid_N)`, seeded at `h:genesis`.
//! - Every action atom's `prev_hash` equals the head just before it.
//!
//! The keyed state store is the source of truth; the index-store span mirror
//! is best-effort and a mirror failure never fails the append.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::atom::{now_iso, Atom, Receipt};
use crate::bounded::FifoMap;
use crate::error::ApiError;
use crate::hash;
use crate::store::{IndexStore, SpanRow, StateStore};

/// The only shard id in this core.
pub const SHARD_ZERO: &str = "0";

/// A hot-window entry: the atom plus its position and resulting head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotAtom {
    /// Ledger sequence number.
    pub seq: u64,
    /// Head hash after this atom.
    pub head: String,
    /// The atom itself, cid (and `prev_hash` for actions) spliced in.
    pub atom: Atom,
}

/// Result of an append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The receipt for the appended (or previously appended) atom.
    pub receipt: Receipt,
    /// True when the cid was already in the dedup window and no new atom
    /// was written.
    pub duplicate: bool,
}

/// Current shard position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Last assigned sequence number (0 when empty).
    pub seq: u64,
    /// Current head hash.
    pub head: String,
}

/// An atom paired with its sequence number, for reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger sequence number.
    pub seq: u64,
    /// The atom.
    pub atom: Atom,
}

/// A page of recent atoms, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPage {
    /// Entries in descending sequence order.
    pub atoms: Vec<LedgerEntry>,
    /// Cursor for the next (older) page, or null when exhausted.
    pub next_cursor: Option<u64>,
}

/// Chain verification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    /// True when every recomputed link matched.
    pub valid: bool,
    /// One entry per broken link, citing the affected sequence number.
    pub errors: Vec<String>,
}

/// Persisted coordinator state document.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerDoc {
    seq: u64,
    head: String,
    hot_prev_head: String,
    hot: Vec<HotAtom>,
    dedup: FifoMap<String, u64>,
}

/// The single-writer ledger coordinator for one `(tenant, shard)` pair.
pub struct LedgerCoordinator {
    tenant_id: String,
    shard: String,
    key: String,
    seq: u64,
    head: String,
    /// Head hash just before the first hot entry (advances on eviction).
    hot_prev_head: String,
    hot: VecDeque<HotAtom>,
    dedup: FifoMap<String, u64>,
    hot_limit: usize,
    state_store: Arc<dyn StateStore>,
    index: Arc<IndexStore>,
}

impl LedgerCoordinator {
    /// Deterministic state-store key for a shard.
    #[must_use]
    pub fn storage_key(tenant_id: &str, shard: &str) -> String {
        format!("{tenant_id}|ledger|{shard}")
    }

    /// Loads shard state from the keyed store, or initializes a fresh shard
    /// at the genesis head.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored document cannot be read.
    pub fn load(
        tenant_id: &str,
        shard: &str,
        hot_limit: usize,
        dedup_limit: usize,
        state_store: Arc<dyn StateStore>,
        index: Arc<IndexStore>,
    ) -> Result<Self, ApiError> {
        let key = Self::storage_key(tenant_id, shard);
        let doc = state_store
            .load(&key)?
            .map(serde_json::from_value::<LedgerDoc>)
            .transpose()?;

        let (seq, head, hot_prev_head, hot, dedup) = match doc {
            Some(doc) => (
                doc.seq,
                doc.head,
                doc.hot_prev_head,
                doc.hot.into(),
                doc.dedup,
            ),
            None => (
                0,
                hash::GENESIS_HEAD.to_string(),
                hash::GENESIS_HEAD.to_string(),
                VecDeque::new(),
                FifoMap::new(dedup_limit),
            ),
        };

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            shard: shard.to_string(),
            key,
            seq,
            head,
            hot_prev_head,
            hot,
            dedup,
            hot_limit,
            state_store,
            index,
        })
    }

    /// Appends an atom, extending the hash chain.
    ///
    /// The atom arrives without a cid (and, for actions, without
    /// `prev_hash`); both are spliced in here. A cid already present in the
    /// dedup window short-circuits to the original receipt with the head
    /// observed at the original insertion.
    ///
    /// # Errors
    ///
    /// Returns an error when the atom is not canonicalizable or the state
    /// store write fails; in both cases nothing is persisted.
    pub fn append_atom(&mut self, mut atom: Atom) -> Result<AppendOutcome, ApiError> {
        let cid = atom.compute_cid()?;

        if let Some(&existing_seq) = self.dedup.get(&cid) {
            let head_hash = self.head_at(existing_seq).unwrap_or_else(|| {
                warn!(
                    tenant = %self.tenant_id,
                    seq = existing_seq,
                    "historical head unavailable for duplicate; using current head"
                );
                self.head.clone()
            });
            return Ok(AppendOutcome {
                receipt: Receipt {
                    ledger_shard: self.shard.clone(),
                    seq: existing_seq,
                    cid,
                    head_hash,
                    time: now_iso(),
                },
                duplicate: true,
            });
        }

        let seq = self.seq + 1;
        let prev = self.head.clone();
        if let Atom::Action(action) = &mut atom {
            action.prev_hash = Some(prev.clone());
        }
        atom.set_cid(cid.clone());
        let head = hash::head_hash(&prev, &cid);

        self.seq = seq;
        self.head = head.clone();
        self.hot.push_back(HotAtom {
            seq,
            head: head.clone(),
            atom: atom.clone(),
        });
        while self.hot.len() > self.hot_limit {
            if let Some(evicted) = self.hot.pop_front() {
                self.hot_prev_head = evicted.head;
            }
        }
        self.dedup.insert(cid.clone(), seq);

        if let Err(err) = self.persist() {
            // The store still holds the pre-append document; restore from it
            // so in-memory state matches the source of truth.
            error!(tenant = %self.tenant_id, seq, error = %err, "ledger persist failed");
            self.reload();
            return Err(err);
        }

        // Mirror into the index store; a mirror failure is logged, never
        // surfaced.
        let size = serde_json::to_string(&atom).map(|s| s.len() as u64).unwrap_or(0);
        let row = SpanRow::from_atom(&atom, seq, &head, size);
        if let Err(err) = self.index.insert_span(&row) {
            warn!(tenant = %self.tenant_id, seq, error = %err, "span mirror failed");
        }

        Ok(AppendOutcome {
            receipt: Receipt {
                ledger_shard: self.shard.clone(),
                seq,
                cid,
                head_hash: head,
                time: now_iso(),
            },
            duplicate: false,
        })
    }

    /// Returns the atom at `seq` and, when it is an action, the immediately
    /// following effect iff that effect references the action's cid.
    ///
    /// Consults the hot window first, then the index-store mirror.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when no atom exists at `seq`.
    pub fn get_by_seq(&self, seq: u64) -> Result<Vec<Atom>, ApiError> {
        let atom = self
            .atom_at(seq)?
            .ok_or_else(|| ApiError::not_found("receipt", format!("span:{seq}")))?;

        let mut atoms = vec![atom.clone()];
        if let Atom::Action(action) = &atom {
            if let Some(Atom::Effect(effect)) = self.atom_at(seq + 1)? {
                if Some(effect.ref_action_cid.as_str()) == action.cid.as_deref() {
                    atoms.push(Atom::Effect(effect));
                }
            }
        }
        Ok(atoms)
    }

    /// Pages recent atoms in descending sequence order.
    ///
    /// `cursor` is exclusive; atoms older than the hot window are served
    /// from the index-store mirror.
    ///
    /// # Errors
    ///
    /// Returns an error on an index-store read failure.
    pub fn query_recent(
        &self,
        cursor: Option<u64>,
        limit: usize,
    ) -> Result<LedgerPage, ApiError> {
        let limit = limit.clamp(1, 200);
        let start = cursor.unwrap_or(self.seq + 1);

        let mut atoms: Vec<LedgerEntry> = self
            .hot
            .iter()
            .rev()
            .filter(|entry| entry.seq < start)
            .take(limit)
            .map(|entry| LedgerEntry {
                seq: entry.seq,
                atom: entry.atom.clone(),
            })
            .collect();

        if atoms.len() < limit {
            let before = atoms.last().map(|e| e.seq).unwrap_or(start);
            for row in self
                .index
                .spans_before(&self.tenant_id, before, limit - atoms.len())?
            {
                atoms.push(LedgerEntry {
                    seq: row.seq,
                    atom: row.atom,
                });
            }
        }

        let next_cursor = match atoms.last() {
            Some(entry) if entry.seq > 1 => Some(entry.seq),
            _ => None,
        };
        Ok(LedgerPage { atoms, next_cursor })
    }

    /// Current `{seq, head}`.
    #[must_use]
    pub fn state(&self) -> LedgerState {
        LedgerState {
            seq: self.seq,
            head: self.head.clone(),
        }
    }

    /// Recomputes every cid and head link over the hot window.
    ///
    /// Checks, per atom: the stored cid against a recomputation, an action's
    /// `prev_hash` against the running head, and the stored head against
    /// `sha256(prev ∥ ":" ∥ cid)`. Finally the last recomputed head must
    /// equal the stored shard head.
    #[must_use]
    pub fn verify_chain(&self) -> ChainReport {
        let mut errors = Vec::new();
        let mut running = self.hot_prev_head.clone();

        for entry in &self.hot {
            let stored_cid = entry.atom.cid().unwrap_or_default().to_string();
            match entry.atom.compute_cid() {
                Ok(recomputed) if recomputed == stored_cid => {}
                Ok(recomputed) => errors.push(format!(
                    "seq {}: cid mismatch (stored {stored_cid}, recomputed {recomputed})",
                    entry.seq
                )),
                Err(err) => errors.push(format!("seq {}: cid recompute failed: {err}", entry.seq)),
            }

            if let Atom::Action(action) = &entry.atom {
                if action.prev_hash.as_deref() != Some(running.as_str()) {
                    errors.push(format!(
                        "seq {}: action prev_hash {} does not match running head {running}",
                        entry.seq,
                        action.prev_hash.as_deref().unwrap_or("<none>")
                    ));
                }
            }

            let expected = hash::head_hash(&running, &stored_cid);
            if expected != entry.head {
                errors.push(format!(
                    "seq {}: head mismatch (stored {}, expected {expected})",
                    entry.seq, entry.head
                ));
            }
            running = entry.head.clone();
        }

        if running != self.head {
            errors.push(format!(
                "final head mismatch (stored {}, recomputed {running})",
                self.head
            ));
        }

        ChainReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Looks up the atom at `seq`: hot window first, then the mirror.
    fn atom_at(&self, seq: u64) -> Result<Option<Atom>, ApiError> {
        if let Some(front) = self.hot.front() {
            if seq >= front.seq && seq <= self.seq {
                // Hot seqs are dense, so the offset is exact.
                let idx = (seq - front.seq) as usize;
                return Ok(self.hot.get(idx).map(|e| e.atom.clone()));
            }
        }
        Ok(self.index.get_span(&self.tenant_id, seq)?.map(|row| row.atom))
    }

    /// The head hash recorded after `seq`, from hot or the mirror.
    fn head_at(&self, seq: u64) -> Option<String> {
        if let Some(front) = self.hot.front() {
            if seq >= front.seq && seq <= self.seq {
                let idx = (seq - front.seq) as usize;
                return self.hot.get(idx).map(|e| e.head.clone());
            }
        }
        self.index
            .get_span(&self.tenant_id, seq)
            .ok()
            .flatten()
            .map(|row| row.head_hash)
    }

    fn persist(&self) -> Result<(), ApiError> {
        let doc = LedgerDoc {
            seq: self.seq,
            head: self.head.clone(),
            hot_prev_head: self.hot_prev_head.clone(),
            hot: self.hot.iter().cloned().collect(),
            dedup: self.dedup.clone(),
        };
        let value = serde_json::to_value(&doc)?;
        self.state_store.save(&self.key, &value)?;
        Ok(())
    }

    /// Re-reads state from the store after a failed persist.
    fn reload(&mut self) {
        match self.state_store.load(&self.key) {
            Ok(Some(value)) => {
                if let Ok(doc) = serde_json::from_value::<LedgerDoc>(value) {
                    self.seq = doc.seq;
                    self.head = doc.head;
                    self.hot_prev_head = doc.hot_prev_head;
                    self.hot = doc.hot.into();
                    self.dedup = doc.dedup;
                }
            }
            Ok(None) => {
                self.seq = 0;
                self.head = hash::GENESIS_HEAD.to_string();
                self.hot_prev_head = hash::GENESIS_HEAD.to_string();
                self.hot.clear();
            }
            Err(err) => {
                error!(key = %self.key, error = %err, "ledger reload failed after persist error");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tamper_hot(&mut self, seq: u64, mutate: impl FnOnce(&mut Atom)) {
        if let Some(front_seq) = self.hot.front().map(|e| e.seq) {
            let idx = (seq - front_seq) as usize;
            if let Some(entry) = self.hot.get_mut(idx) {
                mutate(&mut entry.atom);
            }
        }
    }
}

/// Clonable handle serializing access to one ledger coordinator.
///
/// Rooms and workspaces call the ledger through this handle; the inner
/// mutex is what makes appends on a shard strictly serial.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Arc<tokio::sync::Mutex<LedgerCoordinator>>,
}

impl LedgerHandle {
    /// Wraps a coordinator.
    #[must_use]
    pub fn new(coordinator: LedgerCoordinator) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(coordinator)),
        }
    }

    /// Serialized [`LedgerCoordinator::append_atom`].
    ///
    /// # Errors
    ///
    /// See [`LedgerCoordinator::append_atom`].
    pub async fn append_atom(&self, atom: Atom) -> Result<AppendOutcome, ApiError> {
        self.inner.lock().await.append_atom(atom)
    }

    /// Serialized [`LedgerCoordinator::get_by_seq`].
    ///
    /// # Errors
    ///
    /// See [`LedgerCoordinator::get_by_seq`].
    pub async fn get_by_seq(&self, seq: u64) -> Result<Vec<Atom>, ApiError> {
        self.inner.lock().await.get_by_seq(seq)
    }

    /// Serialized [`LedgerCoordinator::query_recent`].
    ///
    /// # Errors
    ///
    /// See [`LedgerCoordinator::query_recent`].
    pub async fn query_recent(
        &self,
        cursor: Option<u64>,
        limit: usize,
    ) -> Result<LedgerPage, ApiError> {
        self.inner.lock().await.query_recent(cursor, limit)
    }

    /// Serialized [`LedgerCoordinator::state`].
    pub async fn state(&self) -> LedgerState {
        self.inner.lock().await.state()
    }

    /// Serialized [`LedgerCoordinator::verify_chain`].
    pub async fn verify_chain(&self) -> ChainReport {
        self.inner.lock().await.verify_chain()
    }
}

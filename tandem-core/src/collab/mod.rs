//! The replicated document store.
//!
//! Content is an RGA sequence: every atom carries a [`Stamp`] and an insert
//! run is placed right after its origin, past any siblings with a greater
//! stamp. Deleted atoms stay in the sequence as tombstones so later
//! operations can still reference them. Block attributes are
//! last-writer-wins registers ordered by the same stamp.
//!
//! Operations whose causal dependencies have not arrived yet are buffered
//! and integrated as soon as they become ready, so delivery order never
//! matters.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ops::{AtomSpan, EditIntent, MergeOutcome, OpKind, Operation, RejectReason, Stamp};
use crate::{Atom, AtomId, Content, Node, OpId, ReplicaId, Snapshot, StateVector, DEFAULT_BLOCK};

/// Operations a document buffers while waiting for dependencies.
pub const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// How far past the next expected counter of its replica a buffered
/// operation may be.
pub const MAX_COUNTER_GAP: u64 = 10_000;

/// Errors returned to the caller of a local edit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("position {pos} is out of range (document length {len})")]
    OutOfRange { pos: usize, len: usize },
    #[error("block {index} does not exist (document has {count})")]
    NoSuchBlock { index: usize, count: usize },
    #[error("edit is empty")]
    EmptyEdit,
    #[error("attribute key is empty")]
    EmptyKey,
    #[error("snapshots can only be loaded into an empty document")]
    NotPristine,
    #[error("operation could not be integrated: {0}")]
    Rejected(#[from] RejectReason),
}

#[derive(Debug, Clone)]
struct Item {
    id: AtomId,
    stamp: Stamp,
    atom: Atom,
    deleted: bool,
}

type Register = (Stamp, Option<String>);

/// One replica of a collaborative document.
#[derive(Debug, Clone)]
pub struct Document {
    replica: ReplicaId,
    /// Highest Lamport time seen
    lamport: u64,
    /// Genesis marker at index 0, tombstones included
    items: Vec<Item>,
    /// Integrated operations per replica; index = counter - 1
    log: HashMap<ReplicaId, Vec<Operation>>,
    state_vector: StateVector,
    attrs: HashMap<AtomId, BTreeMap<String, Register>>,
    /// Waiting for causal dependencies
    pending: BTreeMap<OpId, Operation>,
    pending_limit: usize,
    /// Number of integrated operations
    version: u64,
    persisted_version: u64,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        let genesis = Item {
            id: AtomId::GENESIS,
            stamp: Stamp::new(0, ReplicaId::GENESIS),
            atom: Atom::block(DEFAULT_BLOCK),
            deleted: false,
        };
        Self {
            replica,
            lamport: 0,
            items: vec![genesis],
            log: HashMap::new(),
            state_vector: StateVector::new(),
            attrs: HashMap::new(),
            pending: BTreeMap::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
            version: 0,
            persisted_version: 0,
        }
    }

    /// Cap the number of buffered out-of-order operations.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn state_vector(&self) -> StateVector {
        self.state_vector.clone()
    }

    /// Number of operations integrated so far. Grows with every applied
    /// operation, local or remote.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Content changed since the last successful snapshot write.
    pub fn is_dirty(&self) -> bool {
        self.version != self.persisted_version
    }

    /// Record that a snapshot taken at `version` was written. The document
    /// only becomes clean if nothing was applied since; returns whether it
    /// is clean now.
    pub fn mark_persisted(&mut self, version: u64) -> bool {
        if version <= self.version && version > self.persisted_version {
            self.persisted_version = version;
        }
        !self.is_dirty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn operation_count(&self) -> usize {
        self.log.values().map(Vec::len).sum()
    }

    /// An integrated operation by id.
    pub fn operation(&self, id: OpId) -> Option<&Operation> {
        if id.counter == 0 {
            return None;
        }
        let index = usize::try_from(id.counter - 1).ok()?;
        self.log.get(&id.replica)?.get(index)
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Turn an edit intent into operations, integrate them and return them
    /// for broadcast.
    pub fn apply_local(&mut self, intent: EditIntent) -> Result<Vec<Operation>, CollabError> {
        let kind = self.resolve(intent)?;
        Ok(vec![self.commit(kind)?])
    }

    fn resolve(&self, intent: EditIntent) -> Result<OpKind, CollabError> {
        match intent {
            EditIntent::Insert { pos, content } => {
                if content.is_empty() {
                    return Err(CollabError::EmptyEdit);
                }
                let origin = self.origin_at(pos)?;
                Ok(OpKind::Insert { origin, content })
            }
            EditIntent::Delete { from, to } => {
                let len = self.visible_len();
                if to > len {
                    return Err(CollabError::OutOfRange { pos: to, len });
                }
                if from >= to {
                    return Err(CollabError::EmptyEdit);
                }
                let ids: Vec<AtomId> = self
                    .visible()
                    .skip(from)
                    .take(to - from)
                    .map(|item| item.id)
                    .collect();
                Ok(OpKind::Delete {
                    spans: spans_of(&ids),
                })
            }
            EditIntent::SetAttribute { block, key, value } => {
                if key.is_empty() {
                    return Err(CollabError::EmptyKey);
                }
                let target = self.block_id(block)?;
                Ok(OpKind::SetAttribute { target, key, value })
            }
        }
    }

    /// Stamp `kind` with the next local id and integrate it.
    pub(crate) fn commit(&mut self, kind: OpKind) -> Result<Operation, CollabError> {
        let counter = self.state_vector.get(&self.replica) + 1;
        let op = Operation {
            id: OpId::new(self.replica, counter),
            lamport: self.lamport.saturating_add(1),
            kind,
        };
        op.validate()?;
        self.integrate(op.clone())?;
        Ok(op)
    }

    // ─── Remote operations ────────────────────────────────────────────

    /// Offer an operation created elsewhere. Idempotent and
    /// order-independent; never panics on bad input.
    pub fn apply_remote(&mut self, op: Operation) -> MergeOutcome {
        if let Err(reason) = op.validate() {
            log::warn!("Rejected operation {}: {reason}", op.id);
            return MergeOutcome::Rejected(reason);
        }

        if self.state_vector.contains(&op.id) {
            return match self.operation(op.id) {
                Some(existing) if *existing == op => MergeOutcome::AlreadySeen,
                _ => {
                    let reason = RejectReason::ConflictingDuplicate(op.id);
                    log::warn!("Rejected operation {}: {reason}", op.id);
                    MergeOutcome::Rejected(reason)
                }
            };
        }

        if let Some(buffered) = self.pending.get(&op.id) {
            if *buffered == op {
                return MergeOutcome::Pending;
            }
            let reason = RejectReason::ConflictingDuplicate(op.id);
            log::warn!("Rejected operation {}: {reason}", op.id);
            return MergeOutcome::Rejected(reason);
        }

        if !self.is_ready(&op) {
            let next = self.state_vector.get(&op.id.replica).saturating_add(1);
            if op.id.counter.saturating_sub(next) >= MAX_COUNTER_GAP {
                let reason = RejectReason::TooFarAhead(op.id);
                log::warn!("Rejected operation {}: {reason}", op.id);
                return MergeOutcome::Rejected(reason);
            }
            if self.pending.len() >= self.pending_limit {
                let reason = RejectReason::BufferFull(self.pending_limit);
                log::warn!("Rejected operation {}: {reason}", op.id);
                return MergeOutcome::Rejected(reason);
            }
            log::debug!(
                "Buffering operation {} until its dependencies arrive",
                op.id
            );
            self.pending.insert(op.id, op);
            return MergeOutcome::Pending;
        }

        let id = op.id;
        if let Err(reason) = self.integrate(op) {
            log::warn!("Rejected operation {id}: {reason}");
            return MergeOutcome::Rejected(reason);
        }
        self.drain_pending();
        MergeOutcome::Applied
    }

    fn is_ready(&self, op: &Operation) -> bool {
        self.state_vector.get(&op.id.replica) + 1 == op.id.counter
            && op
                .dependencies()
                .iter()
                .all(|dep| self.state_vector.contains(dep))
    }

    fn drain_pending(&mut self) {
        loop {
            let next = self
                .pending
                .values()
                .filter(|op| self.is_ready(op))
                .min_by_key(|op| (op.lamport, op.id))
                .map(|op| op.id);
            let Some(id) = next else { break };
            let Some(op) = self.pending.remove(&id) else { break };
            if let Err(reason) = self.integrate(op) {
                log::warn!("Rejected buffered operation {id}: {reason}");
            }
        }
        let applied = &self.state_vector;
        self.pending.retain(|id, _| !applied.contains(id));
    }

    /// Integrate a ready operation. All lookups happen before any mutation,
    /// so a rejected operation leaves the document untouched.
    fn integrate(&mut self, op: Operation) -> Result<(), RejectReason> {
        let stamp = op.stamp();
        match &op.kind {
            OpKind::Insert { origin, content } => {
                let origin_idx = self
                    .index_of(*origin)
                    .ok_or(RejectReason::UnknownAtom(*origin))?;
                if op.lamport <= self.items[origin_idx].stamp.lamport {
                    return Err(RejectReason::Malformed(
                        "insert is not newer than its origin".into(),
                    ));
                }
                let mut idx = origin_idx + 1;
                while idx < self.items.len() && self.items[idx].stamp > stamp {
                    idx += 1;
                }
                let run = content.iter().enumerate().map(|(i, atom)| Item {
                    id: AtomId::new(op.id, i as u32),
                    stamp: Stamp::new(op.lamport.saturating_add(i as u64), op.id.replica),
                    atom: atom.clone(),
                    deleted: false,
                });
                self.items.splice(idx..idx, run);
            }
            OpKind::Delete { spans } => {
                for span in spans {
                    let len = self
                        .run_len(span.op)
                        .ok_or(RejectReason::UnknownAtom(AtomId::new(span.op, span.start)))?;
                    if span.end() > len {
                        return Err(RejectReason::UnknownAtom(AtomId::new(
                            span.op,
                            span.start.saturating_add(span.len - 1),
                        )));
                    }
                }
                let targets: HashSet<AtomId> = spans.iter().flat_map(|s| s.atoms()).collect();
                for item in self.items.iter_mut() {
                    if targets.contains(&item.id) {
                        item.deleted = true;
                    }
                }
            }
            OpKind::SetAttribute { target, key, value } => {
                match self.atom(*target) {
                    Some(atom) if atom.is_block() => {}
                    Some(_) => return Err(RejectReason::NotABlock(*target)),
                    None => return Err(RejectReason::UnknownAtom(*target)),
                }
                let registers = self.attrs.entry(*target).or_default();
                let newer = registers
                    .get(key)
                    .map_or(true, |(existing, _)| stamp > *existing);
                if newer {
                    registers.insert(key.clone(), (stamp, value.clone()));
                }
            }
        }

        self.lamport = self.lamport.max(op.last_lamport());
        self.state_vector.observe(op.id.replica, op.id.counter);
        self.log.entry(op.id.replica).or_default().push(op);
        self.version += 1;
        Ok(())
    }

    // ─── Sync and persistence ─────────────────────────────────────────

    /// Operations known here but not reflected in `remote`, in causal
    /// order.
    pub fn diff(&self, remote: &StateVector) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .log
            .iter()
            .flat_map(|(replica, ops)| {
                let seen = usize::try_from(remote.get(replica)).unwrap_or(usize::MAX);
                ops.iter().skip(seen).cloned()
            })
            .collect();
        ops.sort_by_key(|op| (op.lamport, op.id));
        ops
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.state_vector.clone(), self.diff(&StateVector::new()))
    }

    /// Replay a snapshot into a pristine document. Returns the number of
    /// operations integrated. The loaded state counts as persisted.
    pub fn load_snapshot(&mut self, snapshot: Snapshot) -> Result<usize, CollabError> {
        if !self.is_pristine() {
            return Err(CollabError::NotPristine);
        }
        let before = self.version;
        let expected = snapshot.state_vector;
        for op in snapshot.operations {
            if let MergeOutcome::Rejected(reason) = self.apply_remote(op) {
                log::warn!("Snapshot contained an invalid operation: {reason}");
            }
        }
        if !self.state_vector.dominates(&expected) {
            log::warn!(
                "Snapshot is missing operations; {} remain buffered",
                self.pending.len()
            );
        }
        self.persisted_version = self.version;
        Ok((self.version - before) as usize)
    }

    /// Content is the canonical empty document.
    pub fn is_pristine(&self) -> bool {
        self.visible().next().is_none() && self.effective_attrs(AtomId::GENESIS, &BTreeMap::new()).is_empty()
    }

    // ─── Reading ──────────────────────────────────────────────────────

    pub fn content(&self) -> Content {
        let mut blocks: Vec<Node> = Vec::new();
        for item in self.items.iter().filter(|item| !item.deleted) {
            match &item.atom {
                Atom::Block { kind, attrs } => blocks.push(Node {
                    id: item.id,
                    kind: kind.clone(),
                    attrs: self.effective_attrs(item.id, attrs),
                    text: String::new(),
                }),
                Atom::Char(c) => {
                    if let Some(node) = blocks.last_mut() {
                        node.text.push(*c);
                    }
                }
            }
        }
        Content { blocks }
    }

    /// Plain text, one line per block.
    pub fn text(&self) -> String {
        self.content().text()
    }

    /// Number of addressable positions.
    pub fn visible_len(&self) -> usize {
        self.visible().count()
    }

    pub fn block_count(&self) -> usize {
        1 + self.visible().filter(|item| item.atom.is_block()).count()
    }

    // ─── Helpers (also used by undo) ──────────────────────────────────

    /// Visible atoms, genesis marker excluded.
    fn visible(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().skip(1).filter(|item| !item.deleted)
    }

    fn index_of(&self, id: AtomId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn run_len(&self, id: OpId) -> Option<u64> {
        match &self.operation(id)?.kind {
            OpKind::Insert { content, .. } => Some(content.len() as u64),
            _ => None,
        }
    }

    fn atom(&self, id: AtomId) -> Option<&Atom> {
        if id == AtomId::GENESIS {
            return Some(&self.items[0].atom);
        }
        match &self.operation(id.op)?.kind {
            OpKind::Insert { content, .. } => content.get(id.offset as usize),
            _ => None,
        }
    }

    fn origin_at(&self, pos: usize) -> Result<AtomId, CollabError> {
        if pos == 0 {
            return Ok(AtomId::GENESIS);
        }
        self.visible()
            .nth(pos - 1)
            .map(|item| item.id)
            .ok_or_else(|| CollabError::OutOfRange {
                pos,
                len: self.visible_len(),
            })
    }

    fn block_id(&self, block: usize) -> Result<AtomId, CollabError> {
        if block == 0 {
            return Ok(AtomId::GENESIS);
        }
        self.visible()
            .filter(|item| item.atom.is_block())
            .nth(block - 1)
            .map(|item| item.id)
            .ok_or_else(|| CollabError::NoSuchBlock {
                index: block,
                count: self.block_count(),
            })
    }

    fn effective_attrs(
        &self,
        id: AtomId,
        initial: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut attrs = initial.clone();
        if let Some(registers) = self.attrs.get(&id) {
            for (key, (_, value)) in registers {
                match value {
                    Some(v) => {
                        attrs.insert(key.clone(), v.clone());
                    }
                    None => {
                        attrs.remove(key);
                    }
                }
            }
        }
        attrs
    }

    /// Current value of a block attribute.
    pub(crate) fn attribute(&self, target: AtomId, key: &str) -> Option<String> {
        match self.atom(target)? {
            Atom::Block { attrs, .. } => self.effective_attrs(target, attrs).get(key).cloned(),
            Atom::Char(_) => None,
        }
    }

    /// Current value of an attribute on the `block`-th node.
    pub(crate) fn block_attribute(&self, block: usize, key: &str) -> Result<Option<String>, CollabError> {
        let target = self.block_id(block)?;
        Ok(self.attribute(target, key))
    }

    /// The atom as it currently reads: blocks carry their effective
    /// attributes.
    fn baked(&self, item: &Item) -> Atom {
        match &item.atom {
            Atom::Block { kind, attrs } => Atom::Block {
                kind: kind.clone(),
                attrs: self.effective_attrs(item.id, attrs),
            },
            atom => atom.clone(),
        }
    }

    /// Visible atoms in `[from, to)`, blocks with effective attributes.
    pub(crate) fn visible_atoms(&self, from: usize, to: usize) -> Vec<Atom> {
        self.visible()
            .skip(from)
            .take(to.saturating_sub(from))
            .map(|item| self.baked(item))
            .collect()
    }

    /// Atoms of `targets` in document order, with their current reading.
    pub(crate) fn atoms_in_order(&self, targets: &HashSet<AtomId>) -> Vec<(AtomId, bool, Atom)> {
        self.items
            .iter()
            .filter(|item| targets.contains(&item.id))
            .map(|item| (item.id, item.deleted, self.baked(item)))
            .collect()
    }
}

/// Group atom ids into maximal contiguous spans.
pub(crate) fn spans_of(ids: &[AtomId]) -> Vec<AtomSpan> {
    let mut spans: Vec<AtomSpan> = Vec::new();
    for id in ids {
        match spans.last_mut() {
            Some(span) if span.op == id.op && span.end() == id.offset as u64 => span.len += 1,
            _ => spans.push(AtomSpan::new(id.op, id.offset, 1)),
        }
    }
    spans
}

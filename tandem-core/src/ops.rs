//! Operations exchanged between replicas, and the edit intents that
//! produce them.

use serde::{Deserialize, Serialize};

use crate::{Atom, AtomId, OpId, ReplicaId};

/// Highest Lamport time an operation may occupy. Leaves headroom so local
/// clocks never wrap after observing a remote time.
pub const MAX_LAMPORT: u64 = u64::MAX / 2;

/// Total order used for every tie-break: Lamport time first, then replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }
}

/// A contiguous range of atoms from one insert run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomSpan {
    pub op: OpId,
    pub start: u32,
    pub len: u32,
}

impl AtomSpan {
    pub fn new(op: OpId, start: u32, len: u32) -> Self {
        Self { op, start, len }
    }

    pub fn atoms(&self) -> impl Iterator<Item = AtomId> + '_ {
        (self.start..self.start.saturating_add(self.len)).map(move |offset| AtomId::new(self.op, offset))
    }

    pub fn end(&self) -> u64 {
        self.start as u64 + self.len as u64
    }
}

/// The closed set of mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert a run of atoms right after `origin`.
    Insert { origin: AtomId, content: Vec<Atom> },
    /// Tombstone the listed atoms.
    Delete { spans: Vec<AtomSpan> },
    /// Set (`Some`) or remove (`None`) a block attribute.
    SetAttribute {
        target: AtomId,
        key: String,
        value: Option<String>,
    },
}

/// An immutable, uniquely identified mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    /// Lamport time of the operation. For an insert run, atom `i` has
    /// time `lamport + i`.
    pub lamport: u64,
    pub kind: OpKind,
}

impl Operation {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport, self.id.replica)
    }

    /// Highest Lamport time this operation occupies.
    pub fn last_lamport(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { content, .. } => {
                self.lamport
                    .saturating_add((content.len() as u64).saturating_sub(1))
            }
            _ => self.lamport,
        }
    }

    /// Operations that must be integrated before this one: the previous
    /// operation of the same replica plus every operation it references.
    pub fn dependencies(&self) -> Vec<OpId> {
        let mut deps = Vec::new();
        if self.id.counter > 1 {
            deps.push(OpId::new(self.id.replica, self.id.counter - 1));
        }
        match &self.kind {
            OpKind::Insert { origin, .. } => deps.push(origin.op),
            OpKind::Delete { spans } => deps.extend(spans.iter().map(|s| s.op)),
            OpKind::SetAttribute { target, .. } => deps.push(target.op),
        }
        deps.retain(|d| !d.replica.is_genesis());
        deps.sort();
        deps.dedup();
        deps
    }

    /// Structural checks that need no document state.
    pub fn validate(&self) -> Result<(), RejectReason> {
        if self.id.replica.is_genesis() {
            return Err(RejectReason::ReservedReplica);
        }
        if self.id.counter == 0 {
            return Err(RejectReason::ZeroCounter);
        }
        if self.lamport == 0 {
            return Err(RejectReason::ZeroLamport);
        }
        let span = match &self.kind {
            OpKind::Insert { content, .. } => (content.len() as u64).saturating_sub(1),
            _ => 0,
        };
        match self.lamport.checked_add(span) {
            Some(last) if last <= MAX_LAMPORT => {}
            _ => return Err(RejectReason::LamportOverflow),
        }
        match &self.kind {
            OpKind::Insert { origin, content } => {
                if content.is_empty() {
                    return Err(RejectReason::EmptyInsert);
                }
                if content.len() > u32::MAX as usize {
                    return Err(RejectReason::Malformed("insert run too long".into()));
                }
                if origin.op == self.id {
                    return Err(RejectReason::SelfReference);
                }
            }
            OpKind::Delete { spans } => {
                if spans.is_empty() || spans.iter().any(|s| s.len == 0) {
                    return Err(RejectReason::EmptyDelete);
                }
                if spans.iter().any(|s| s.op.replica.is_genesis()) {
                    return Err(RejectReason::GenesisDelete);
                }
                if spans.iter().any(|s| s.op == self.id) {
                    return Err(RejectReason::SelfReference);
                }
            }
            OpKind::SetAttribute { target, key, .. } => {
                if key.is_empty() {
                    return Err(RejectReason::EmptyKey);
                }
                if target.op == self.id {
                    return Err(RejectReason::SelfReference);
                }
            }
        }
        Ok(())
    }
}

/// Result of offering a remote operation to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Integrated; content may have changed.
    Applied,
    /// Already integrated earlier; ignored.
    AlreadySeen,
    /// Buffered until the operations it depends on arrive.
    Pending,
    /// Structurally invalid; discarded without touching state.
    Rejected(RejectReason),
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Why an operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("operation uses the reserved genesis replica")]
    ReservedReplica,
    #[error("operation counter must start at 1")]
    ZeroCounter,
    #[error("lamport time must be positive")]
    ZeroLamport,
    #[error("lamport time exceeds the supported range")]
    LamportOverflow,
    #[error("insert carries no content")]
    EmptyInsert,
    #[error("delete names no atoms")]
    EmptyDelete,
    #[error("attribute key is empty")]
    EmptyKey,
    #[error("operation references itself")]
    SelfReference,
    #[error("the genesis block cannot be deleted")]
    GenesisDelete,
    #[error("{0} does not name an inserted atom")]
    UnknownAtom(AtomId),
    #[error("attribute target {0} is not a block")]
    NotABlock(AtomId),
    #[error("operation {0} is too far ahead of its replica's history")]
    TooFarAhead(OpId),
    #[error("pending buffer is full ({0} operations)")]
    BufferFull(usize),
    #[error("operation {0} was already applied with different contents")]
    ConflictingDuplicate(OpId),
    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// A user-level edit, in content-model coordinates.
///
/// Positions index the visible atoms of the document, not counting the
/// genesis block marker: position 0 is the start of the first block's
/// text and every later block marker occupies one position. `block`
/// indexes nodes, 0 being the genesis block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditIntent {
    Insert { pos: usize, content: Vec<Atom> },
    Delete { from: usize, to: usize },
    SetAttribute {
        block: usize,
        key: String,
        value: Option<String>,
    },
}

impl EditIntent {
    pub fn insert_text(pos: usize, text: &str) -> Self {
        EditIntent::Insert {
            pos,
            content: Atom::text(text),
        }
    }

    pub fn insert_block(pos: usize, kind: impl Into<String>) -> Self {
        EditIntent::Insert {
            pos,
            content: vec![Atom::block(kind)],
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        EditIntent::Delete { from, to }
    }

    pub fn set_attribute(block: usize, key: impl Into<String>, value: Option<&str>) -> Self {
        EditIntent::SetAttribute {
            block,
            key: key.into(),
            value: value.map(str::to_string),
        }
    }
}

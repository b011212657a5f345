//! # tandem-core — Replicated document model for Tandem
//!
//! A document is a sequence of atoms (characters and block boundaries)
//! maintained as an RGA-style CRDT, plus last-writer-wins attribute
//! registers on blocks. Replicas exchange immutable [`Operation`]s and
//! converge regardless of delivery order.
//!
//! ```text
//! EditIntent ──► Document::apply_local ──► Operation ──► (transport)
//!                                                            │
//! Operation  ──► Document::apply_remote ◄────────────────────┘
//!                      │
//!                      ├── StateVector  (what this replica has seen)
//!                      ├── diff()       (what a peer is missing)
//!                      └── Snapshot     (at-rest export)
//! ```
//!
//! ## Modules
//!
//! - [`collab`] — the [`Document`] store
//! - [`ops`] — operation and edit-intent types
//! - [`state_vector`] — per-replica causal summary
//! - [`content`] — block tree view of a document
//! - [`snapshot`] — persistence export format
//! - [`undo`] — collaborative and linear undo/redo

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod collab;
pub mod content;
pub mod ops;
pub mod snapshot;
pub mod state_vector;
pub mod undo;

pub use collab::{CollabError, Document};
pub use content::{Content, Node};
pub use ops::{AtomSpan, EditIntent, MergeOutcome, OpKind, Operation, RejectReason, Stamp};
pub use snapshot::{Snapshot, SnapshotError};
pub use state_vector::StateVector;
pub use undo::{UndoManager, UndoMode};

/// Block kind of the genesis block every document starts with.
pub const DEFAULT_BLOCK: &str = "paragraph";

/// Identity of one replica of a document.
///
/// Ordered so that concurrent edits can be tie-broken without negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    /// Reserved for the genesis block; never used by a live replica.
    pub const GENESIS: ReplicaId = ReplicaId(Uuid::nil());

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_genesis(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Unique identity of an operation: `(replica, counter)`.
///
/// Counters start at 1; counter 0 belongs to the genesis block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub const GENESIS: OpId = OpId {
        replica: ReplicaId::GENESIS,
        counter: 0,
    };

    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// One element of an insert run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AtomId {
    pub op: OpId,
    pub offset: u32,
}

impl AtomId {
    /// The genesis block marker. Always present, never deletable.
    pub const GENESIS: AtomId = AtomId {
        op: OpId::GENESIS,
        offset: 0,
    };

    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.op, self.offset)
    }
}

/// Smallest unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    /// A character belonging to the enclosing block.
    Char(char),
    /// A block boundary: starts a new node with the given kind and
    /// initial attributes.
    Block {
        kind: String,
        attrs: BTreeMap<String, String>,
    },
}

impl Atom {
    pub fn block(kind: impl Into<String>) -> Self {
        Atom::Block {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Atom::Block { .. })
    }

    /// Atoms for a piece of plain text.
    pub fn text(text: &str) -> Vec<Atom> {
        text.chars().map(Atom::Char).collect()
    }
}

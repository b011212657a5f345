//! Undo and redo of local edits.
//!
//! Two flavours, picked once per session:
//!
//! - **Collaborative**: every step remembers the operations this replica
//!   produced and reverts exactly those, by atom identity. Concurrent edits
//!   by other replicas are never touched, and the reverting operations are
//!   ordinary operations that get broadcast like any other edit.
//! - **Linear**: a positional history of inverse edits for a document that
//!   nobody else is editing.

use std::collections::{HashSet, VecDeque};

use crate::collab::spans_of;
use crate::{AtomId, CollabError, Document, EditIntent, OpKind, Operation};

/// Default number of undo steps kept.
pub const DEFAULT_UNDO_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoMode {
    /// Revert only this replica's own operations.
    Collaborative,
    /// Positional inverse edits. Only correct without concurrent editors.
    Linear,
}

#[derive(Debug, Clone)]
enum Step {
    /// Operations to revert, each with the attribute value it replaced.
    Revert(Vec<(Operation, Option<String>)>),
    /// Edit that undoes the previous one.
    Edit(EditIntent),
}

/// Undo/redo history of one replica.
#[derive(Debug)]
pub struct UndoManager {
    mode: UndoMode,
    undo: VecDeque<Step>,
    redo: Vec<Step>,
    limit: usize,
}

impl UndoManager {
    pub fn new(mode: UndoMode) -> Self {
        Self {
            mode,
            undo: VecDeque::new(),
            redo: Vec::new(),
            limit: DEFAULT_UNDO_LIMIT,
        }
    }

    /// Keep at most `limit` undo steps; the oldest are dropped first.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn mode(&self) -> UndoMode {
        self.mode
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Apply a local edit and record how to undo it. Clears the redo
    /// history.
    pub fn apply(
        &mut self,
        doc: &mut Document,
        intent: EditIntent,
    ) -> Result<Vec<Operation>, CollabError> {
        let (ops, step) = match self.mode {
            UndoMode::Linear => {
                let inverse = linear_inverse(doc, &intent)?;
                let ops = doc.apply_local(intent)?;
                (ops, Step::Edit(inverse))
            }
            UndoMode::Collaborative => {
                let prior = match &intent {
                    EditIntent::SetAttribute { block, key, .. } => {
                        doc.block_attribute(*block, key)?
                    }
                    _ => None,
                };
                let ops = doc.apply_local(intent)?;
                let entries = ops.iter().map(|op| (op.clone(), prior.clone())).collect();
                (ops, Step::Revert(entries))
            }
        };
        self.push_undo(step);
        self.redo.clear();
        Ok(ops)
    }

    /// Revert the most recent step. Returns the operations produced, empty
    /// when there is nothing left to undo.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Vec<Operation>, CollabError> {
        while let Some(step) = self.undo.pop_back() {
            match perform(doc, &step) {
                Ok(Some((ops, counterpart))) => {
                    self.redo.push(counterpart);
                    return Ok(ops);
                }
                // Everything it touched is already gone
                Ok(None) => continue,
                Err(e) => {
                    self.undo.push_back(step);
                    return Err(e);
                }
            }
        }
        Ok(Vec::new())
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&mut self, doc: &mut Document) -> Result<Vec<Operation>, CollabError> {
        while let Some(step) = self.redo.pop() {
            match perform(doc, &step) {
                Ok(Some((ops, counterpart))) => {
                    self.push_undo(counterpart);
                    return Ok(ops);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.redo.push(step);
                    return Err(e);
                }
            }
        }
        Ok(Vec::new())
    }

    fn push_undo(&mut self, step: Step) {
        self.undo.push_back(step);
        while self.undo.len() > self.limit {
            self.undo.pop_front();
        }
    }
}

/// Run a step and build the step that takes it back.
fn perform(
    doc: &mut Document,
    step: &Step,
) -> Result<Option<(Vec<Operation>, Step)>, CollabError> {
    match step {
        Step::Edit(intent) => {
            let inverse = linear_inverse(doc, intent)?;
            let ops = doc.apply_local(intent.clone())?;
            Ok(Some((ops, Step::Edit(inverse))))
        }
        Step::Revert(entries) => {
            let mut ops = Vec::new();
            let mut counterpart = Vec::new();
            for (op, prior) in entries.iter().rev() {
                let Some((kind, replaced)) = revert_kind(doc, op, prior) else {
                    continue;
                };
                let reverted = doc.commit(kind)?;
                counterpart.push((reverted.clone(), replaced));
                ops.push(reverted);
            }
            if ops.is_empty() {
                return Ok(None);
            }
            Ok(Some((ops, Step::Revert(counterpart))))
        }
    }
}

/// The operation kind that reverts `op`, and the attribute value it will
/// replace. `None` if nothing of `op` is left to revert.
fn revert_kind(
    doc: &Document,
    op: &Operation,
    prior: &Option<String>,
) -> Option<(OpKind, Option<String>)> {
    match &op.kind {
        OpKind::Insert { content, .. } => {
            let targets: HashSet<AtomId> = (0..content.len() as u32)
                .map(|offset| AtomId::new(op.id, offset))
                .collect();
            let visible: Vec<AtomId> = doc
                .atoms_in_order(&targets)
                .into_iter()
                .filter(|(_, deleted, _)| !deleted)
                .map(|(id, _, _)| id)
                .collect();
            if visible.is_empty() {
                return None;
            }
            Some((
                OpKind::Delete {
                    spans: spans_of(&visible),
                },
                None,
            ))
        }
        OpKind::Delete { spans } => {
            let targets: HashSet<AtomId> = spans.iter().flat_map(|s| s.atoms()).collect();
            let atoms = doc.atoms_in_order(&targets);
            // Copies go right after the last removed atom, where the
            // removed range used to be.
            let origin = atoms.last()?.0;
            let content = atoms.into_iter().map(|(_, _, atom)| atom).collect();
            Some((OpKind::Insert { origin, content }, None))
        }
        OpKind::SetAttribute { target, key, .. } => {
            let current = doc.attribute(*target, key);
            Some((
                OpKind::SetAttribute {
                    target: *target,
                    key: key.clone(),
                    value: prior.clone(),
                },
                current,
            ))
        }
    }
}

/// Positional edit that undoes `intent` on the document as it is now.
fn linear_inverse(doc: &Document, intent: &EditIntent) -> Result<EditIntent, CollabError> {
    Ok(match intent {
        EditIntent::Insert { pos, content } => EditIntent::Delete {
            from: *pos,
            to: pos + content.len(),
        },
        EditIntent::Delete { from, to } => EditIntent::Insert {
            pos: *from,
            content: doc.visible_atoms(*from, *to),
        },
        EditIntent::SetAttribute { block, key, .. } => EditIntent::SetAttribute {
            block: *block,
            key: key.clone(),
            value: doc.block_attribute(*block, key)?,
        },
    })
}

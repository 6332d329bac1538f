// calls.rs — Call-site classification
//
// Maps every called name in a model to a closed `CallKind` once, before code
// generation. Emitters match on the kind; no other module compares call
// names against the event builtins.
//
// Preconditions: `ModelMetadata` has been built (all bodies parsed).
// Postconditions: every call name appearing in any block has an entry.
// Failure modes: none (unknown names classify as `External`).
// Side effects: none.

use std::collections::BTreeMap;

use crate::ast::{Expr, StatementBlock};
use crate::model::ModelMetadata;

/// How a call site is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    /// `net_send(delay, flag)`: schedule a self event.
    NetSend,
    /// `net_move(t)`: reschedule the pending self event.
    NetMove,
    /// `net_event(t)`: fire an outgoing spike.
    NetEvent,
    /// Call into a FUNCTION or PROCEDURE carrying a TABLE.
    Table(String),
    /// Call into a FUNCTION or PROCEDURE defined by the model.
    Method(String),
    /// Math library or simulator routine.
    External(String),
}

impl CallKind {
    pub fn is_event(&self) -> bool {
        matches!(self, CallKind::NetSend | CallKind::NetMove | CallKind::NetEvent)
    }
}

/// Classification of the event builtins.
pub fn builtin(name: &str) -> Option<CallKind> {
    match name {
        "net_send" => Some(CallKind::NetSend),
        "net_move" => Some(CallKind::NetMove),
        "net_event" => Some(CallKind::NetEvent),
        _ => None,
    }
}

/// Resolved call kinds for one model.
#[derive(Debug, Clone, Default)]
pub struct CallTable {
    kinds: BTreeMap<String, CallKind>,
}

impl CallTable {
    /// Kind of a call site; unknown names are external.
    pub fn kind(&self, name: &str) -> CallKind {
        self.kinds
            .get(name)
            .cloned()
            .unwrap_or_else(|| CallKind::External(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Names of model-defined routines called from `block`.
    pub fn methods_called_in(&self, block: &StatementBlock) -> Vec<String> {
        let mut names = Vec::new();
        block.walk_exprs(&mut |e| {
            if let Expr::Call(call) = e {
                if let CallKind::Method(n) | CallKind::Table(n) = self.kind(&call.name.name) {
                    if !names.contains(&n) {
                        names.push(n);
                    }
                }
            }
        });
        names
    }
}

/// Classify every call site of the model.
pub fn classify(metadata: &ModelMetadata) -> CallTable {
    let mut table = CallTable::default();
    for callable in metadata.functions.iter().chain(&metadata.procedures) {
        let kind = if callable.table.is_some() {
            CallKind::Table(callable.name.clone())
        } else {
            CallKind::Method(callable.name.clone())
        };
        table.kinds.insert(callable.name.clone(), kind);
    }
    for block in metadata.all_blocks() {
        block.walk_exprs(&mut |e| {
            if let Expr::Call(call) = e {
                let name = &call.name.name;
                if table.kinds.contains_key(name) {
                    return;
                }
                let kind = builtin(name).unwrap_or_else(|| CallKind::External(name.clone()));
                table.kinds.insert(name.clone(), kind);
            }
        });
    }
    table
}

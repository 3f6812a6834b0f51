//! Token table and continuation records
//!
//! A token names a suspended computation. Its record holds exactly what is
//! needed to pick the computation back up, plus the bookkeeping every token
//! shares: parent and children, a cleanup callback, chaining, inversion and
//! the waiters blocked on it. The executor's `resume` module drives these
//! records; this module only stores them.
//!
//! Retired ids are remembered with their final status for a while so that a
//! chain or wait arriving just after completion still sees the outcome.

use crate::ast::{ObjectRef, ParsedCommand, Position, Value};
use crate::executor::LoopFrame;
use crate::state::{ExecutionState, MacroFrame};
use crate::substitution::BraceSpan;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use thiserror::Error;

/// Runs exactly once when a token retires, whatever the path
pub type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenError {
    #[error("token not found or exhausted: {0}")]
    NotFound(String),
    #[error("token {0} is already running")]
    Busy(String),
    #[error("timed out waiting for token {0}")]
    WaitTimeout(String),
}

/// Saved point of a generator body
pub struct GeneratorState {
    pub commands: Arc<Vec<ParsedCommand>>,
    /// Index of the next command to run
    pub next: usize,
    pub state: Arc<ExecutionState>,
    pub frame: Option<Arc<MacroFrame>>,
    /// Loop suspended mid-body, resumed before `next`
    pub pending_loop: Option<Box<LoopFrame>>,
}

/// Cursor over a claimed list
#[derive(Debug, Clone, PartialEq)]
pub enum IteratorCursor {
    Each { list: ObjectRef, index: usize },
    Pair { list: ObjectRef, keys: Vec<String>, index: usize },
}

impl IteratorCursor {
    pub fn list(&self) -> ObjectRef {
        match self {
            IteratorCursor::Each { list, .. } | IteratorCursor::Pair { list, .. } => *list,
        }
    }
}

/// What a brace sub-expression produced
#[derive(Debug, Clone, PartialEq)]
pub enum BraceOutcome {
    /// Value to splice; a reference carries a claim held by the record
    Value(Value),
    Failed,
}

pub struct BraceRecord {
    pub span: BraceSpan,
    pub state: Arc<ExecutionState>,
    /// Token of an asynchronous evaluation
    pub token: Option<String>,
    pub outcome: Option<BraceOutcome>,
}

impl BraceRecord {
    pub fn is_complete(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Where a command continues once all of its braces are in
pub struct BraceResume {
    pub state: Arc<ExecutionState>,
    pub frame: Option<Arc<MacroFrame>>,
    pub position: Position,
    pub invert: bool,
}

/// Tracks sibling brace evaluations of one command
pub struct BraceCoordinator {
    pub text: String,
    pub records: Vec<BraceRecord>,
    pub waiter: BraceResume,
}

impl BraceCoordinator {
    pub fn pending(&self) -> usize {
        self.records.iter().filter(|r| !r.is_complete()).count()
    }
}

pub enum Continuation {
    /// Remaining commands of a sequence that suspended
    Sequence {
        commands: Vec<ParsedCommand>,
        state: Arc<ExecutionState>,
        frame: Option<Arc<MacroFrame>>,
    },
    Generator(GeneratorState),
    Iterator(IteratorCursor),
    Braces(BraceCoordinator),
    /// Completion of one async brace of a coordinator
    BraceLink { coordinator: String, index: usize },
    /// Macro call finishing asynchronously: hand the result to the caller
    ScopeExit {
        child: Arc<ExecutionState>,
        parent: Arc<ExecutionState>,
    },
}

impl Continuation {
    pub fn kind(&self) -> &'static str {
        match self {
            Continuation::Sequence { .. } => "sequence",
            Continuation::Generator(_) => "generator",
            Continuation::Iterator(_) => "iterator",
            Continuation::Braces(_) => "braces",
            Continuation::BraceLink { .. } => "brace-link",
            Continuation::ScopeExit { .. } => "scope-exit",
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

pub struct TokenRecord {
    pub id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub cleanup: Option<Cleanup>,
    pub state: Option<Arc<ExecutionState>>,
    pub position: Position,
    pub invert: bool,
    pub chained: Option<String>,
    pub continuation: Option<Continuation>,
    pub waiters: Vec<Sender<bool>>,
    /// Dropping this sender stops the timeout thread
    pub timer: Option<Sender<()>>,
    /// Continuation taken out while it runs
    pub running: bool,
}

impl TokenRecord {
    pub fn new(id: String) -> Self {
        TokenRecord {
            id,
            parent: None,
            children: Vec::new(),
            cleanup: None,
            state: None,
            position: Position::default(),
            invert: false,
            chained: None,
            continuation: None,
            waiters: Vec::new(),
            timer: None,
            running: false,
        }
    }

    pub fn is_generator(&self) -> bool {
        matches!(
            self.continuation,
            Some(Continuation::Generator(_)) | Some(Continuation::Iterator(_))
        )
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("invert", &self.invert)
            .field("chained", &self.chained)
            .field("continuation", &self.continuation)
            .field("running", &self.running)
            .finish()
    }
}

/// Live tokens plus a bounded memo of recently retired ones
pub struct TokenTable {
    next_id: u64,
    records: HashMap<String, TokenRecord>,
    settled: HashMap<String, bool>,
    settled_order: VecDeque<String>,
    memo_cap: usize,
}

impl TokenTable {
    pub fn new(memo_cap: usize) -> Self {
        TokenTable {
            next_id: 1,
            records: HashMap::new(),
            settled: HashMap::new(),
            settled_order: VecDeque::new(),
            memo_cap,
        }
    }

    /// Ids are unique for the life of the table
    pub fn next_id(&mut self) -> String {
        let id = format!("token-{}", self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, record: TokenRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<&TokenRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TokenRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<TokenRecord> {
        self.records.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort_by_key(|id| {
            id.trim_start_matches("token-")
                .parse::<u64>()
                .unwrap_or(u64::MAX)
        });
        ids
    }

    /// Remember a retired token's final status
    pub fn settle(&mut self, id: &str, status: bool) {
        if self.memo_cap == 0 {
            return;
        }
        if self.settled.insert(id.to_string(), status).is_none() {
            self.settled_order.push_back(id.to_string());
        }
        while self.settled_order.len() > self.memo_cap {
            if let Some(old) = self.settled_order.pop_front() {
                self.settled.remove(&old);
            }
        }
    }

    pub fn settled(&self, id: &str) -> Option<bool> {
        self.settled.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let mut table = TokenTable::new(4);
        let a = table.next_id();
        let b = table.next_id();
        assert_eq!(a, "token-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_settled_memo_is_bounded() {
        let mut table = TokenTable::new(2);
        table.settle("token-1", true);
        table.settle("token-2", false);
        table.settle("token-3", true);
        assert_eq!(table.settled("token-1"), None);
        assert_eq!(table.settled("token-2"), Some(false));
        assert_eq!(table.settled("token-3"), Some(true));
    }

    #[test]
    fn test_ids_sorted_numerically() {
        let mut table = TokenTable::new(0);
        for _ in 0..10 {
            let id = table.next_id();
            table.insert(TokenRecord::new(id));
        }
        let ids = table.ids();
        assert_eq!(ids.first().map(String::as_str), Some("token-1"));
        assert_eq!(ids.last().map(String::as_str), Some("token-10"));
    }
}

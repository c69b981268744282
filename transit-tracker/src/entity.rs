//! Watched entities and their transfer state.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use transit_event::Outcome;

/// Identity of a file, independent of its destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityId {
    pub scope: String,
    pub name: String,
}

impl EntityId {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Lifecycle state of a watched transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    InProgress,
    Done,
    Failed,
}

impl TransferState {
    /// Done and Failed accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Failed)
    }

    /// State reached by a terminal outcome
    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => TransferState::Done,
            Outcome::Failed | Outcome::SubmissionFailed => TransferState::Failed,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TransferState::Queued => 0,
            TransferState::InProgress => 1,
            TransferState::Done | TransferState::Failed => 2,
        }
    }

    /// Whether moving to `next` goes forward
    pub fn advances_to(&self, next: TransferState) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Queued => "queued",
            TransferState::InProgress => "in_progress",
            TransferState::Done => "done",
            TransferState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file observed at one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEntity {
    pub id: EntityId,
    pub destination: String,

    /// `None` until the first queued-class event arrives
    pub state: Option<TransferState>,

    /// Outcome of the terminal event, once seen
    pub outcome: Option<Outcome>,

    /// Request id of the most recent attempt
    pub request_id: Option<String>,

    /// Set when a terminal event has been applied
    pub completed: bool,

    /// Creation time of the last applied event
    pub updated_at: Option<NaiveDateTime>,
}

impl WatchedEntity {
    pub fn new(id: EntityId, destination: impl Into<String>) -> Self {
        Self {
            id,
            destination: destination.into(),
            state: None,
            outcome: None,
            request_id: None,
            completed: false,
            updated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(|s| s.is_terminal())
    }
}

/// The set of `(identity, destination)` pairs a run observes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    entries: Vec<(EntityId, String)>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every name in `scope` at every destination
    pub fn product<N, D>(scope: &str, names: N, destinations: D) -> Self
    where
        N: IntoIterator,
        N::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let destinations: Vec<String> = destinations
            .into_iter()
            .map(|d| d.as_ref().to_string())
            .collect();
        let mut set = Self::new();
        for name in names {
            for destination in &destinations {
                set.insert(EntityId::new(scope, name.as_ref()), destination.clone());
            }
        }
        set
    }

    /// Add a pair; duplicates are kept out
    pub fn insert(&mut self, id: EntityId, destination: impl Into<String>) {
        let destination = destination.into();
        if !self
            .entries
            .iter()
            .any(|(i, d)| i == &id && d == &destination)
        {
            self.entries.push((id, destination));
        }
    }

    pub fn with(mut self, id: EntityId, destination: impl Into<String>) -> Self {
        self.insert(id, destination);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &str)> {
        self.entries.iter().map(|(id, d)| (id, d.as_str()))
    }
}

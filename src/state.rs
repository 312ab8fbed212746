use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Contract shared by the per-item automata: a wire name, a static table
/// of legal successors, and a designated failure terminal.
pub trait ItemState: Copy + Eq + std::fmt::Debug + 'static {
    fn initial() -> Self;
    fn failure() -> Self;
    fn as_str(&self) -> &'static str;
    fn successors(&self) -> &'static [Self];

    fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid transition: {from} -> {to} (valid targets: {allowed})")]
    Invalid {
        from: &'static str,
        to: &'static str,
        allowed: String,
    },
}

/// Per-item state for the five-step Solution flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolutionState {
    Detected,
    Validating,
    Validated,
    Deleting,
    DeleteFailed,
    Migrating,
    MigrationFailed,
    WaitingConfirmation,
    Confirmed,
    PostUpdate,
    PostUpdateFailed,
    Completed,
    Skipped,
    Failed,
}

impl SolutionState {
    pub const ALL: &'static [SolutionState] = &[
        SolutionState::Detected,
        SolutionState::Validating,
        SolutionState::Validated,
        SolutionState::Deleting,
        SolutionState::DeleteFailed,
        SolutionState::Migrating,
        SolutionState::MigrationFailed,
        SolutionState::WaitingConfirmation,
        SolutionState::Confirmed,
        SolutionState::PostUpdate,
        SolutionState::PostUpdateFailed,
        SolutionState::Completed,
        SolutionState::Skipped,
        SolutionState::Failed,
    ];
}

impl ItemState for SolutionState {
    fn initial() -> Self {
        SolutionState::Detected
    }

    fn failure() -> Self {
        SolutionState::Failed
    }

    fn as_str(&self) -> &'static str {
        match self {
            SolutionState::Detected => "DETECTED",
            SolutionState::Validating => "VALIDATING",
            SolutionState::Validated => "VALIDATED",
            SolutionState::Deleting => "DELETING",
            SolutionState::DeleteFailed => "DELETE_FAILED",
            SolutionState::Migrating => "MIGRATING",
            SolutionState::MigrationFailed => "MIGRATION_FAILED",
            SolutionState::WaitingConfirmation => "WAITING_CONFIRMATION",
            SolutionState::Confirmed => "CONFIRMED",
            SolutionState::PostUpdate => "POST_UPDATE",
            SolutionState::PostUpdateFailed => "POST_UPDATE_FAILED",
            SolutionState::Completed => "COMPLETED",
            SolutionState::Skipped => "SKIPPED",
            SolutionState::Failed => "FAILED",
        }
    }

    fn successors(&self) -> &'static [SolutionState] {
        use SolutionState::*;
        match self {
            Detected => &[Validating],
            Validating => &[Validated, Skipped, Failed],
            Validated => &[Deleting],
            Deleting => &[Migrating, DeleteFailed],
            DeleteFailed => &[Failed],
            Migrating => &[WaitingConfirmation, MigrationFailed],
            WaitingConfirmation => &[Confirmed, MigrationFailed],
            MigrationFailed => &[Failed],
            Confirmed => &[PostUpdate],
            PostUpdate => &[Completed, PostUpdateFailed],
            PostUpdateFailed => &[Failed],
            Completed | Skipped | Failed => &[],
        }
    }
}

/// Per-item state for the four-step OE flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OeState {
    Detected,
    Validating,
    Analyzing,
    Validated,
    NotImpacted,
    AttachmentUpdated,
    RemediationStarted,
    Remediated,
    Skipped,
    Failed,
}

impl OeState {
    pub const ALL: &'static [OeState] = &[
        OeState::Detected,
        OeState::Validating,
        OeState::Analyzing,
        OeState::Validated,
        OeState::NotImpacted,
        OeState::AttachmentUpdated,
        OeState::RemediationStarted,
        OeState::Remediated,
        OeState::Skipped,
        OeState::Failed,
    ];
}

impl ItemState for OeState {
    fn initial() -> Self {
        OeState::Detected
    }

    fn failure() -> Self {
        OeState::Failed
    }

    fn as_str(&self) -> &'static str {
        match self {
            OeState::Detected => "DETECTED",
            OeState::Validating => "VALIDATING",
            OeState::Analyzing => "ANALYZING",
            OeState::Validated => "VALIDATED",
            OeState::NotImpacted => "NOT_IMPACTED",
            OeState::AttachmentUpdated => "ATTACHMENT_UPDATED",
            OeState::RemediationStarted => "REMEDIATION_STARTED",
            OeState::Remediated => "REMEDIATED",
            OeState::Skipped => "SKIPPED",
            OeState::Failed => "FAILED",
        }
    }

    fn successors(&self) -> &'static [OeState] {
        use OeState::*;
        match self {
            Detected => &[Validating],
            Validating => &[Analyzing, Skipped, Failed],
            Analyzing => &[Validated, NotImpacted, Failed],
            Validated => &[AttachmentUpdated, Failed],
            AttachmentUpdated => &[RemediationStarted, Failed],
            RemediationStarted => &[Remediated, Failed],
            Remediated | NotImpacted | Skipped | Failed => &[],
        }
    }
}

/// One recorded transition: `(from, to, reason)`.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: &'static str,
    pub to: &'static str,
    pub reason: String,
}

/// Snapshot of a machine's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub item_id: String,
    pub current: &'static str,
    pub history: Vec<TransitionRecord>,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Per-item automaton. Enforces the legal-successor table, records the
/// transition history, and captures the reason that drove the item into
/// the failure terminal.
#[derive(Debug)]
pub struct StateMachine<S: ItemState> {
    item_id: String,
    current: S,
    history: Vec<TransitionRecord>,
    started_at: DateTime<Utc>,
    error: Option<String>,
}

impl<S: ItemState> StateMachine<S> {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            current: S::initial(),
            history: Vec::new(),
            started_at: Utc::now(),
            error: None,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn can_transition(&self, target: S) -> bool {
        self.current.successors().contains(&target)
    }

    /// Move to `target`, recording the transition. An illegal target fails
    /// without mutating any state.
    pub fn transition(&mut self, target: S, reason: &str) -> Result<S, TransitionError> {
        if !self.can_transition(target) {
            return Err(TransitionError::Invalid {
                from: self.current.as_str(),
                to: target.as_str(),
                allowed: self
                    .current
                    .successors()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        self.history.push(TransitionRecord {
            from: self.current.as_str(),
            to: target.as_str(),
            reason: reason.to_string(),
        });
        self.current = target;
        if target == S::failure() {
            self.error = Some(reason.to_string());
        }
        Ok(self.current)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            item_id: self.item_id.clone(),
            current: self.current.as_str(),
            history: self.history.clone(),
            started_at: self.started_at,
            error: self.error.clone(),
        }
    }
}

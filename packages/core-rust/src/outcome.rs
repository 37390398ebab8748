//! Terminal classification of a finished operation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ticket::{Code, Completion, Termination};

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Both sides finished normally. The status may still be non-OK.
    Completed,
    /// Cancelled by either side.
    Cancelled,
    /// A deadline passed before the call finished.
    Expired,
    /// A customer fault, transport failure, or protocol violation.
    Erroneous,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Erroneous => "erroneous",
        };
        f.write_str(name)
    }
}

/// Which side of the call produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Decided by this side (local abort, local timer, local fault).
    Local,
    /// Reported by the peer in an inbound ticket.
    Remote,
}

/// The terminal result recorded exactly once per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub code: Option<Code>,
    pub details: Option<String>,
    pub origin: Origin,
}

impl Outcome {
    /// Outcome of the given kind without status or details.
    #[must_use]
    pub fn new(kind: OutcomeKind, origin: Origin) -> Self {
        Self {
            kind,
            code: None,
            details: None,
            origin,
        }
    }

    /// Normal completion carrying the status of the given completion.
    #[must_use]
    pub fn completed(completion: Option<&Completion>) -> Self {
        Self {
            kind: OutcomeKind::Completed,
            code: completion.and_then(|c| c.code),
            details: completion.and_then(|c| c.message.clone()),
            origin: Origin::Local,
        }
    }

    #[must_use]
    pub fn cancelled(origin: Origin) -> Self {
        Self::new(OutcomeKind::Cancelled, origin)
    }

    #[must_use]
    pub fn expired(origin: Origin) -> Self {
        Self::new(OutcomeKind::Expired, origin)
    }

    #[must_use]
    pub fn erroneous(origin: Origin, details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::new(OutcomeKind::Erroneous, origin)
        }
    }

    /// The ticket termination that tells the peer about this outcome.
    ///
    /// Returns `None` for outcomes the peer must not be told about: normal
    /// completions (already signalled by completion tickets) and outcomes
    /// the peer itself reported.
    #[must_use]
    pub fn abort_termination(&self) -> Option<Termination> {
        if self.origin == Origin::Remote {
            return None;
        }
        match self.kind {
            OutcomeKind::Completed => None,
            OutcomeKind::Cancelled => Some(Termination::Cancellation),
            OutcomeKind::Expired => Some(Termination::Expiration),
            OutcomeKind::Erroneous => Some(Termination::Failure {
                message: self.details.clone(),
            }),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(details) = &self.details {
            write!(f, ": {details}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_carries_status() {
        let completion = Completion::with_status(Code(9), "failed precondition");
        let outcome = Outcome::completed(Some(&completion));
        assert_eq!(outcome.kind, OutcomeKind::Completed);
        assert_eq!(outcome.code, Some(Code(9)));
        assert_eq!(outcome.details.as_deref(), Some("failed precondition"));

        let bare = Outcome::completed(None);
        assert_eq!(bare.code, None);
        assert_eq!(bare.details, None);
    }

    #[test]
    fn local_aborts_map_to_terminations() {
        assert_eq!(
            Outcome::cancelled(Origin::Local).abort_termination(),
            Some(Termination::Cancellation)
        );
        assert_eq!(
            Outcome::expired(Origin::Local).abort_termination(),
            Some(Termination::Expiration)
        );
        assert_eq!(
            Outcome::erroneous(Origin::Local, "boom").abort_termination(),
            Some(Termination::Failure {
                message: Some("boom".to_string())
            })
        );
        assert_eq!(Outcome::completed(None).abort_termination(), None);
    }

    #[test]
    fn remote_outcomes_are_not_echoed() {
        assert_eq!(Outcome::cancelled(Origin::Remote).abort_termination(), None);
        assert_eq!(Outcome::expired(Origin::Remote).abort_termination(), None);
    }

    #[test]
    fn display_includes_code_and_details() {
        let outcome = Outcome::completed(Some(&Completion::with_status(Code(5), "missing")));
        assert_eq!(outcome.to_string(), "completed (code 5): missing");
        assert_eq!(Outcome::cancelled(Origin::Local).to_string(), "cancelled");
    }
}

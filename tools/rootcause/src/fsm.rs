use crate::errors::RcaError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Normalizing,
    Matching,
    Grouping,
    Inferring,
    Reporting,
    Completed,
    Degraded,
    Failed,
}

impl AnalysisState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Normalizing => "normalizing",
            Self::Matching => "matching",
            Self::Grouping => "grouping",
            Self::Inferring => "inferring",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Degraded | Self::Failed)
    }
}

/// Progress of one analysis run through its stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRun {
    pub state: AnalysisState,
    pub degraded_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub history: Vec<AnalysisState>,
}

impl Default for AnalysisRun {
    fn default() -> Self {
        Self {
            state: AnalysisState::Pending,
            degraded_reason: None,
            failure_reason: None,
            history: vec![AnalysisState::Pending],
        }
    }
}

impl AnalysisRun {
    pub fn transition(&mut self, next: AnalysisState) -> Result<(), RcaError> {
        validate_transition(self.state, next)?;
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Records why the run will end degraded. The first reason sticks.
    pub fn mark_degraded(&mut self, reason: impl Into<String>) {
        if self.degraded_reason.is_none() {
            self.degraded_reason = Some(reason.into());
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }

    /// Skips the remaining work stages after a deadline or cancellation.
    pub fn short_circuit(&mut self, reason: impl Into<String>) -> Result<(), RcaError> {
        self.mark_degraded(reason);
        if self.state != AnalysisState::Reporting {
            self.transition(AnalysisState::Reporting)?;
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), RcaError> {
        self.failure_reason = Some(reason.into());
        self.transition(AnalysisState::Failed)
    }

    pub fn finish(&mut self) -> Result<AnalysisState, RcaError> {
        let terminal = if self.is_degraded() {
            AnalysisState::Degraded
        } else {
            AnalysisState::Completed
        };
        self.transition(terminal)?;
        Ok(terminal)
    }
}

pub fn validate_transition(from: AnalysisState, to: AnalysisState) -> Result<(), RcaError> {
    use AnalysisState as S;

    let allowed = match from {
        S::Pending => matches!(to, S::Normalizing | S::Failed),
        S::Normalizing => matches!(to, S::Matching | S::Reporting | S::Failed),
        S::Matching => matches!(to, S::Grouping | S::Reporting | S::Failed),
        S::Grouping => matches!(to, S::Inferring | S::Reporting | S::Failed),
        S::Inferring => matches!(to, S::Reporting | S::Failed),
        S::Reporting => matches!(to, S::Completed | S::Degraded | S::Failed),
        S::Completed | S::Degraded | S::Failed => false,
    };

    if !allowed {
        return Err(RcaError::InvalidConfig(format!(
            "illegal transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

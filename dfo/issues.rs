//! Structured operational issues.
//!
//! Every anomaly the orchestrator can raise has a stable name that shows
//! up as the `issue` field of the emitted log event, so shifters and tests
//! can match on it regardless of message wording.

use lib::comms::{DataType, SendError};
use lib::types::{RunNumber, TriggerNumber};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Error, Debug)]
pub enum Issue {
    #[error(
        "trigger decision {trigger_number} of run {run_number} was never \
         completed"
    )]
    IncompleteTriggerDecision {
        trigger_number: TriggerNumber,
        run_number: RunNumber,
    },

    #[error(
        "received run number {received} from {origin} while the current run \
         is {current} (trigger {trigger_number})"
    )]
    RunNumberMismatch {
        received: RunNumber,
        current: RunNumber,
        origin: String,
        trigger_number: TriggerNumber,
    },

    #[error(
        "unable to assign trigger decision {trigger_number}: no usable \
         endpoint"
    )]
    UnableToAssign { trigger_number: TriggerNumber },

    #[error(
        "trigger decision {trigger_number} assigned to busy endpoint \
         {connection_name} ({used_slots} slots in use)"
    )]
    AssignedToBusyApp {
        trigger_number: TriggerNumber,
        connection_name: String,
        used_slots: usize,
    },

    #[error("endpoint {connection_name}: {message}")]
    TrbAppUpdate {
        connection_name: String,
        message: String,
    },

    #[error("received a token from unknown endpoint {connection_name}")]
    UnknownTokenSource { connection_name: String },

    #[error(
        "no assigned trigger decision {trigger_number} at endpoint \
         {connection_name}"
    )]
    AssignedTriggerDecisionNotFound {
        trigger_number: TriggerNumber,
        connection_name: String,
    },

    #[error("no {direction} connection of data type {data_type}")]
    MissingConnection {
        data_type: DataType,
        direction: &'static str,
    },

    #[error("send through \"{target}\" failed: {source}")]
    OperationFailed {
        target: String,
        #[source]
        source: SendError,
    },

    #[error(
        "busy threshold ({busy}) is smaller than free threshold ({free})"
    )]
    ThresholdsNotConsistent { busy: usize, free: usize },
}

impl Issue {
    /// The stable name surfaced in the `issue` log field.
    pub fn name(&self) -> &'static str {
        match self {
            Issue::IncompleteTriggerDecision { .. } => {
                "IncompleteTriggerDecision"
            }
            Issue::RunNumberMismatch { .. } => "RunNumberMismatch",
            Issue::UnableToAssign { .. } => "UnableToAssign",
            Issue::AssignedToBusyApp { .. } => "AssignedToBusyApp",
            Issue::TrbAppUpdate { .. } => "TRBModuleAppUpdate",
            Issue::UnknownTokenSource { .. } => "UnknownTokenSource",
            Issue::AssignedTriggerDecisionNotFound { .. } => {
                "AssignedTriggerDecisionNotFound"
            }
            Issue::MissingConnection { .. } => "MissingConnection",
            Issue::OperationFailed { .. } => "OperationFailed",
            Issue::ThresholdsNotConsistent { .. } => {
                "DFOThresholdsNotConsistent"
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Issue::AssignedToBusyApp { .. } | Issue::OperationFailed { .. } => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

/// Emits the issue on the log at its severity, tagged with its stable name.
pub fn report(issue: &Issue) {
    match issue.severity() {
        Severity::Warning => warn!(issue = issue.name(), "{issue}"),
        Severity::Error => error!(issue = issue.name(), "{issue}"),
    }
}

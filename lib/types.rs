//! Message types exchanged between the upstream trigger, the orchestrator
//! and the downstream trigger record builders.

use serde::{Deserialize, Serialize};

pub type RunNumber = u32;
pub type TriggerNumber = u64;
pub type Timestamp = u64;

/// Readout window requested from one data source for a trigger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequest {
    pub source_id: u32,
    pub window_begin: Timestamp,
    pub window_end: Timestamp,
}

/// Instruction to build a trigger record. Produced by the upstream
/// trigger; the orchestrator forwards it unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub trigger_number: TriggerNumber,
    pub run_number: RunNumber,
    /// Bit-packed set of [`TriggerType`]s that fired for this decision.
    pub trigger_type: u64,
    pub trigger_timestamp: Timestamp,
    pub components: Vec<ComponentRequest>,
}

/// Completion receipt emitted by a trigger record builder for a
/// previously assigned decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDecisionToken {
    pub run_number: RunNumber,
    pub trigger_number: TriggerNumber,
    /// Connection name of the builder that completed (or registers).
    pub decision_destination: String,
}

impl TriggerDecisionToken {
    /// The registration / reconnection sentinel for an endpoint.
    pub fn registration(decision_destination: impl Into<String>) -> Self {
        Self {
            run_number: 0,
            trigger_number: 0,
            decision_destination: decision_destination.into(),
        }
    }

    pub fn is_registration(&self) -> bool {
        self.run_number == 0 && self.trigger_number == 0
    }
}

/// Back-pressure signal to the upstream trigger. `busy == true` means
/// stop issuing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInhibit {
    pub busy: bool,
    pub run_number: RunNumber,
}

/// Trigger candidate types, one per bit of `TriggerDecision::trigger_type`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Timing,
    Prescale,
    Random,
    Software,
    LowEnergy,
    HighEnergy,
    Supernova,
    Calibration,
    Unknown,
}

impl TriggerType {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerType::Timing => "timing",
            TriggerType::Prescale => "prescale",
            TriggerType::Random => "random",
            TriggerType::Software => "software",
            TriggerType::LowEnergy => "low_energy",
            TriggerType::HighEnergy => "high_energy",
            TriggerType::Supernova => "supernova",
            TriggerType::Calibration => "calibration",
            TriggerType::Unknown => "unknown",
        }
    }

    fn from_bit(bit: u32) -> Self {
        match bit {
            0 => TriggerType::Timing,
            1 => TriggerType::Prescale,
            2 => TriggerType::Random,
            3 => TriggerType::Software,
            4 => TriggerType::LowEnergy,
            5 => TriggerType::HighEnergy,
            6 => TriggerType::Supernova,
            7 => TriggerType::Calibration,
            _ => TriggerType::Unknown,
        }
    }
}

/// Unpacks the bit-packed type set carried by a decision.
pub fn unpack_trigger_types(bits: u64) -> Vec<TriggerType> {
    (0..u64::BITS)
        .filter(|bit| bits & (1u64 << bit) != 0)
        .map(TriggerType::from_bit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_sentinel_is_detected() {
        let token = TriggerDecisionToken::registration("trb-01");
        assert!(token.is_registration());

        let token = TriggerDecisionToken {
            run_number: 7,
            trigger_number: 0,
            decision_destination: "trb-01".into(),
        };
        assert!(!token.is_registration());
    }

    #[test]
    fn unpack_follows_bit_positions() {
        assert!(unpack_trigger_types(0).is_empty());
        assert_eq!(
            vec![TriggerType::Timing, TriggerType::Random],
            unpack_trigger_types(0b101)
        );
        // Bits without a named type map to Unknown.
        assert_eq!(vec![TriggerType::Unknown], unpack_trigger_types(1 << 20));
    }
}

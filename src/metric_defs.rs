use metrics::{describe_counter, describe_gauge, Unit};

/// Optional but adds description/help message to the metrics emitted to
/// metric sink.
pub(crate) fn install_metrics() {
    describe_counter!(
        "dfo.received_decisions",
        Unit::Count,
        "Trigger decisions received from the trigger"
    );
    describe_counter!(
        "dfo.sent_decisions",
        Unit::Count,
        "Trigger decisions forwarded to trigger record builders"
    );
    describe_counter!(
        "dfo.received_tokens",
        Unit::Count,
        "Completion tokens received from trigger record builders"
    );
    describe_counter!(
        "dfo.waiting_for_decision_us",
        Unit::Microseconds,
        "Time spent waiting between trigger decisions"
    );
    describe_counter!(
        "dfo.deciding_destination_us",
        Unit::Microseconds,
        "Time spent selecting a destination endpoint"
    );
    describe_counter!(
        "dfo.forwarding_decision_us",
        Unit::Microseconds,
        "Time spent forwarding decisions downstream"
    );
    describe_counter!(
        "dfo.waiting_for_token_us",
        Unit::Microseconds,
        "Time spent waiting between completion tokens"
    );
    describe_counter!(
        "dfo.processing_token_us",
        Unit::Microseconds,
        "Time spent processing completion tokens"
    );
    describe_counter!(
        "dfo.trigger_decisions.received",
        Unit::Count,
        "Trigger decisions received, by trigger type"
    );
    describe_counter!(
        "dfo.trigger_decisions.completed",
        Unit::Count,
        "Trigger decisions completed, by trigger type"
    );

    // Per-endpoint state
    describe_gauge!(
        "dfo.endpoint.outstanding_decisions",
        Unit::Count,
        "Decisions assigned to an endpoint and not yet completed"
    );
    describe_gauge!(
        "dfo.endpoint.in_error",
        Unit::Count,
        "Whether the endpoint is currently masked as errored"
    );
    describe_counter!(
        "dfo.endpoint.completed_decisions",
        Unit::Count,
        "Decisions completed by an endpoint"
    );
    describe_gauge!(
        "dfo.endpoint.min_completion_time_us",
        Unit::Microseconds,
        "Fastest completion observed since the last publication"
    );
    describe_gauge!(
        "dfo.endpoint.max_completion_time_us",
        Unit::Microseconds,
        "Slowest completion observed since the last publication"
    );
    describe_gauge!(
        "dfo.endpoint.average_completion_time_us",
        Unit::Microseconds,
        "Average completion time since the last publication"
    );
}

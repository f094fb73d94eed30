//! Identifiers for runs, steps, lease owners and event sequence numbers.

/// Run identifier (unique across the store).
pub type RunId = String;

/// Step identifier, unique within one run graph.
pub type StepId = String;

/// Worker identity that holds leases.
pub type OwnerId = String;

/// Event sequence number. Strictly increasing across the whole event log.
pub type Seq = u64;

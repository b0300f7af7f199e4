use thiserror::Error;

/// Fatal planner failures. None of these are retried internally; the caller's
/// control loop decides whether and how to retry with corrected inputs.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid trainer ctxs: {0}")]
    InvalidConfig(String),

    #[error("no feasible pipeline template for dp={dp} pp={pp} with {tp_groups} tp groups")]
    NoFeasibleTemplate {
        dp: usize,
        pp: usize,
        tp_groups: usize,
    },

    #[error("no possible strategies: every template's ILP was infeasible")]
    NoPossibleStrategies,

    #[error(
        "can't find a normal tp group to place here (node {node_idx}); bug in DFS bookkeeping"
    )]
    PlacementExhausted { node_idx: usize },

    #[error("ilp solver error: {0}")]
    Solver(String),
}

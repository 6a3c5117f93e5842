use thiserror::Error;

/**
 * Every error here is fatal for the `simulate` call that produced it. Missing
 * optional attributes or bindings never show up as errors, they fall back to
 * defaults where they are read.
 */
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("failed to reserve storage for {requested} particles")]
    Allocation { requested: usize },

    #[error("{family}: particle index {index} out of range (count: {count})")]
    IndexOutOfRange {
        family: &'static str,
        index: usize,
        count: usize,
    },

    #[error("{family}: built against particle generation {built}, store is at {current}")]
    StaleParticleRange {
        family: &'static str,
        built: u64,
        current: u64,
    },

    #[error("malformed rest data: {0}")]
    MalformedRestData(String),

    #[error("{family}: produced non-finite particle positions")]
    NonFinite { family: &'static str },

    #[error("no particle range starts at index {start}")]
    UnknownRange { start: usize },
}

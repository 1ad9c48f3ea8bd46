//! Error taxonomy for the SRCNN pipeline.
//!
//! Every variant is fatal: a failure anywhere in the pipeline indicates a
//! wiring bug or an exhausted static limit, never a transient condition, so
//! nothing here is retried. Errors bubble to the top-level caller which is
//! expected to abort the run. Device resources are reclaimed by RAII before
//! an error propagates.

/// Errors raised by the compute context, dispatch layer, and pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SrcnnError {
    /// Malformed or invalid configuration (non-odd spatial size, bad filter
    /// counts, unreadable parameter file). Surfaced before pipeline
    /// construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Allocation or kernel table capacity exceeded. Requires raising the
    /// static limits; there is nothing to free at runtime.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Malformed work-size or local-memory parameters for a dispatch.
    /// Non-retryable programmer error; checked before every enqueue because
    /// GPU-side failures are cryptic and late.
    #[error("invalid dispatch: {0}")]
    DispatchValidation(String),

    /// A buffer is smaller than the shape it is declared to hold, or a
    /// read/write range exceeds an allocation's recorded size.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    /// Compile or enqueue failure reported by the compute platform. Carries
    /// the platform's diagnostic text verbatim.
    #[error("device error: {0}")]
    Device(String),

    /// Filesystem failure while reading or writing parameter/config files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SrcnnError>;

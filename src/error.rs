use thiserror::Error;

/// Typed errors for configuration and spawn failures.
///
/// Most plumbing uses `anyhow::Result`; these variants exist where callers
/// need to distinguish a bad queue-group definition from an IO failure.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue group named a worker kind that was never registered.
    #[error("unknown worker kind '{kind}' in queue group '{queue_group}'")]
    UnknownWorkerKind { kind: String, queue_group: String },

    /// A worker kind name does not match `[A-Za-z_][A-Za-z0-9_]*`.
    #[error("invalid worker kind identifier '{0}'")]
    InvalidKindIdent(String),

    /// The configuration document could not be interpreted.
    #[error("configuration error: {0}")]
    Config(String),
}

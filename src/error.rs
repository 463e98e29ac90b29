use thiserror::Error;

/// Errors local to the request path.
///
/// None of these propagate to the HTTP pipeline as failures. The filter
/// degrades to BYPASS and lets the upstream answer traverse; only the
/// management surface turns errors into explicit status codes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cache memory exhausted")]
    ArenaFull,

    #[error("unable to build cache key")]
    KeyBuild,

    #[error("upstream aborted before the response completed")]
    UpstreamFailure,

    #[error("persistence I/O failed: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("no matching entry")]
    NotFound,
}

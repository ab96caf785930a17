//! Failure taxonomy for the provisioning workflow.
//!
//! Functions return `anyhow::Result`; these variants are attached at the
//! point of failure so the top-level handler can tell a clean operator
//! cancellation from a real failure with `downcast_ref`.

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The release API answered with something other than a release list,
    /// usually a rate-limit message object.
    #[error("release API unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("no storage with support for VM images is available")]
    NoStorageAvailable,

    #[error("failed to download {0}")]
    DownloadFailed(String),

    #[error("failed to unpack image: {0}")]
    ExtractFailed(String),

    #[error("failed to import image into VM {0}")]
    ImportFailed(u32),

    #[error("cancelled by operator")]
    Cancelled,

    /// SIGINT or SIGTERM arrived while the run was in progress.
    #[error("interrupted")]
    Interrupted,
}

/// True if the error chain is an operator cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(ProvisionError::Cancelled))
}

/// True if the run was stopped by SIGINT or SIGTERM.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(find(err), Some(ProvisionError::Interrupted))
}

/// Attach `kind` as context to `err`, unless `err` is an interrupt, which
/// is reported as itself.
pub fn unless_interrupted(err: anyhow::Error, kind: ProvisionError) -> anyhow::Error {
    if is_interrupted(&err) {
        err
    } else {
        err.context(kind)
    }
}

/// The first [`ProvisionError`] found anywhere in the chain.
pub fn find(err: &anyhow::Error) -> Option<&ProvisionError> {
    err.downcast_ref::<ProvisionError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<ProvisionError>()))
}

use crate::download::{DownloadError, FailureKind, classify_error};
use crate::primary::PrimaryError;
use crate::store::ErrorKind;

/// Persisted kind and user-facing message for a failed transfer.
pub(super) fn transfer_failure(error: &DownloadError) -> (ErrorKind, String) {
    let kind = classify_error(error).error_kind();
    (kind, build_actionable_error_message(&error.to_string(), kind))
}

/// Kind for a primary failure that happened before any bytes moved.
pub(super) fn resolution_failure_kind(error: &PrimaryError) -> ErrorKind {
    match error {
        PrimaryError::HttpStatus { status } if (400..500).contains(status) && *status != 429 => {
            ErrorKind::Permanent
        }
        PrimaryError::InvalidBaseUrl { .. } => ErrorKind::Configuration,
        PrimaryError::Transfer(inner) => classify_error(inner).error_kind(),
        _ => FailureKind::TransientNetwork.error_kind(),
    }
}

pub(super) fn build_actionable_error_message(base: &str, kind: ErrorKind) -> String {
    if base.contains("Suggestion:") {
        return base.to_string();
    }

    let suggestion = match kind {
        ErrorKind::Transient => {
            "Check network connectivity; the record is retried automatically by `hashfetch run`."
        }
        ErrorKind::Permanent => {
            "Verify the hash is correct and still served upstream, then `hashfetch reactivate` it."
        }
        ErrorKind::Filesystem => {
            "Check free space and permissions on the temp and destination directories."
        }
        ErrorKind::Configuration => {
            "Set [primary].key (or HASHFETCH_PRIMARY_KEY) or configure [fallback].url_template."
        }
    };

    format!("{base}\n  Suggestion: {suggestion}")
}

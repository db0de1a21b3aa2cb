//! Core error handling module
//!
//! • One taxonomy shared by every fetch contract and the engine itself
//! • `Clone` so a single outcome can be handed to every waiter of a shared job
//! • Stable markers for the structured `tracing` events that report failures
//! • `#[non_exhaustive]` for forward-compatible extension
use std::io::{self, ErrorKind};

use compact_str::{CompactString, ToCompactString};
use thiserror::Error;

/// Convenient alias carrying our unified error type
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Primary error enumeration (grouped by concern)
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    // ────────────────────────────────────────────────────────────
    // Content fetch outcomes
    // ────────────────────────────────────────────────────────────
    #[error("Not found: {0}")]
    NotFound(CompactString),

    #[error("Access denied: {0}")]
    AccessDenied(CompactString),

    #[error("Operation Cancelled: {0}")]
    Cancelled(CompactString),

    #[error("Operation failed: {0}")]
    Failed(CompactString),

    // ────────────────────────────────────────────────────────────
    // Object resources
    // ────────────────────────────────────────────────────────────
    #[error("Thumbnail failed: {identifier} - {reason}")]
    ThumbnailFailed {
        identifier: CompactString,
        reason:     CompactString,
    },

    #[error("Metadata failed: {identifier} - {reason}")]
    MetadataFailed {
        identifier: CompactString,
        reason:     CompactString,
    },

    #[error("Download failed: {identifier} - {reason}")]
    DownloadFailed {
        identifier: CompactString,
        reason:     CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // File-system and persistence
    // ────────────────────────────────────────────────────────────
    #[error("I/O error: {context} - {kind:?}")]
    Io {
        context: CompactString,
        kind:    ErrorKind,
    },

    #[error("State persistence error: {0}")]
    State(CompactString),
}

// ────────────────────────────────────────────────────────────────────────────
// Fast classification helpers
// ────────────────────────────────────────────────────────────────────────────
impl CatalogError {
    /// Superseded or torn-down work. Never surfaced to users.
    #[inline]
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Determine whether a later request for the same thing may succeed
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_)
                | Self::Failed(_)
                | Self::ThumbnailFailed { .. }
                | Self::MetadataFailed { .. }
                | Self::DownloadFailed { .. }
                | Self::Io {
                    kind: ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock,
                    ..
                }
        )
    }

    // ────────────────────────────────────────────────────────────
    // Attribute helpers – used for JSON log grouping
    // ────────────────────────────────────────────────────────────
    #[inline]
    #[must_use]
    pub const fn operation_type(&self) -> &'static str {
        match self {
            Self::NotFound(_)
            | Self::AccessDenied(_)       => "content_access",

            Self::Cancelled(_)            => "cancellation",

            Self::Failed(_)               => "content_fetch",

            Self::ThumbnailFailed { .. }
            | Self::MetadataFailed { .. }
            | Self::DownloadFailed { .. } => "resource_fetch",

            Self::Io { .. }               => "filesystem",

            Self::State(_)                => "state_persistence",
        }
    }

    #[inline]
    #[must_use]
    pub const fn error_marker(&self) -> &'static str {
        match self {
            Self::NotFound(_)             => "ERROR_NOT_FOUND",
            Self::AccessDenied(_)         => "ERROR_ACCESS_DENIED",
            Self::Cancelled(_)            => "ERROR_CANCELLED",
            Self::Failed(_)               => "ERROR_FETCH_FAILED",
            Self::ThumbnailFailed { .. }  => "ERROR_THUMBNAIL",
            Self::MetadataFailed { .. }   => "ERROR_METADATA",
            Self::DownloadFailed { .. }   => "ERROR_DOWNLOAD",
            Self::Io { .. }               => "ERROR_IO",
            Self::State(_)                => "ERROR_STATE",
        }
    }

    // ────────────────────────────────────────────────────────────
    // Smart constructors
    // ────────────────────────────────────────────────────────────
    #[inline]
    #[must_use]
    pub fn not_found(what: &str) -> Self {
        Self::NotFound(what.to_compact_string())
    }

    #[inline]
    #[must_use]
    pub fn access_denied(what: &str) -> Self {
        Self::AccessDenied(what.to_compact_string())
    }

    #[inline]
    #[must_use]
    pub fn cancelled(what: &str) -> Self {
        Self::Cancelled(what.to_compact_string())
    }

    #[inline]
    #[must_use]
    pub fn failed(reason: impl Into<CompactString>) -> Self {
        Self::Failed(reason.into())
    }

    #[inline]
    #[must_use]
    pub fn thumbnail_failed(identifier: &str, reason: impl Into<CompactString>) -> Self {
        Self::ThumbnailFailed {
            identifier: identifier.to_compact_string(),
            reason:     reason.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn metadata_failed(identifier: &str, reason: impl Into<CompactString>) -> Self {
        Self::MetadataFailed {
            identifier: identifier.to_compact_string(),
            reason:     reason.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn download_failed(identifier: &str, reason: impl Into<CompactString>) -> Self {
        Self::DownloadFailed {
            identifier: identifier.to_compact_string(),
            reason:     reason.into(),
        }
    }

    /// Map an I/O error on `context` to the catalog taxonomy.
    #[must_use]
    pub fn from_io(err: &io::Error, context: &str) -> Self {
        match err.kind() {
            ErrorKind::NotFound         => Self::not_found(context),
            ErrorKind::PermissionDenied => Self::access_denied(context),
            kind => Self::Io {
                context: context.to_compact_string(),
                kind,
            },
        }
    }
}

impl From<io::Error> for CatalogError {
    fn from(err: io::Error) -> Self {
        Self::from_io(&err, "unknown path")
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::State(err.to_compact_string())
    }
}

impl From<tokio::task::JoinError> for CatalogError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::cancelled("background task")
        } else {
            Self::failed(format!("background task panicked: {err}"))
        }
    }
}

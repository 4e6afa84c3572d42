//! Typed error classes for failures callers need to tell apart.
//!
//! Most fallible paths in this crate return `eyre::Result` with contextual
//! messages, matching the rest of the storage code. The three cases below are
//! the ones a caller must be able to match on programmatically, so they are
//! concrete types attached to the report chain and reachable through
//! `eyre::Report::downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    /// A pointer field resolved ambiguously, or the structure observed on a
    /// page contradicts the tree invariants, in a way that no in-progress
    /// checkpoint can explain. The store is damaged; there is no node-level
    /// recovery.
    #[error("tree inconsistency: {0}")]
    Inconsistency(String),

    /// The store on disk was created with a different format version, page
    /// size or layout than the one requested at open.
    #[error("metadata mismatch opening store: {0}")]
    MetadataMismatch(String),

    /// A second writer session was requested while one is still open.
    #[error("a writer session is already open; only one writer is allowed at a time")]
    WriterAlreadyOpen,
}

impl TreeError {
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        TreeError::Inconsistency(msg.into())
    }

    pub fn metadata_mismatch(msg: impl Into<String>) -> Self {
        TreeError::MetadataMismatch(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inconsistency_is_downcastable_through_eyre() {
        let report: eyre::Report = TreeError::inconsistency("successor pointer in crash state").into();

        let err = report.downcast_ref::<TreeError>();
        assert!(matches!(err, Some(TreeError::Inconsistency(_))));
    }

    #[test]
    fn metadata_mismatch_message_names_the_problem() {
        let err = TreeError::metadata_mismatch("layout identifier 7 != 9");
        assert!(err.to_string().contains("metadata mismatch"));
        assert!(err.to_string().contains("layout identifier"));
    }
}

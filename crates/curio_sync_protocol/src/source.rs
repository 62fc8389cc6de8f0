//! Writer source tags.
//!
//! Every write carries the identifier of the writer that caused it. Besides
//! per-tab client ids there are sentinels for writes that must never be
//! re-captured as new outgoing changes.

/// Writes replayed from the server by the apply engine.
pub const IGNORED_SOURCE: &str = "IGNORED_SOURCE";

/// Rows written from a server fetch.
pub const FETCH_SOURCE: &str = "FETCH_SOURCE";

/// Undo writes performed by a change tracker revert.
pub const REVERT_SOURCE: &str = "REVERT_SOURCE";

/// Returns true for the sentinel sources above.
#[must_use]
pub fn is_ignored_source(source: &str) -> bool {
    matches!(source, IGNORED_SOURCE | FETCH_SOURCE | REVERT_SOURCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_ignored() {
        assert!(is_ignored_source(IGNORED_SOURCE));
        assert!(is_ignored_source(FETCH_SOURCE));
        assert!(is_ignored_source(REVERT_SOURCE));
        assert!(!is_ignored_source("3f2a9c"));
    }
}

//! Placeholder library target; the actual scenario coverage lives under
//! `tests/` as integration tests against the public crate APIs.

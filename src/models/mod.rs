//! Data models for archive references.
//!
//! A reference record stored in the key-value backend deserializes into an
//! ordered list of [`descriptor::FileDescriptor`]s. Order is significant: it
//! fixes archive entry order and the tie-break order for name deduplication.

pub mod descriptor;

//! Storage
//!
//! Metadata images and the file header are read and written through a tokio file.

pub(crate) mod file;

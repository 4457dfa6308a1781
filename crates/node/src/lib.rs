//! Composition root: one process runs one role's synchronization services.

pub mod app;

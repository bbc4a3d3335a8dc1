//! Adapters implementing the domain ports over concrete backends.

pub mod sqlite;

//! Shared types for the keycombo daemon and its control client.

pub mod config;
pub mod error;
pub mod ipc;
pub mod keys;

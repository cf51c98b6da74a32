// src/export/mod.rs
//! Downstream consumers of the alert store.
pub mod misp;
pub mod text;

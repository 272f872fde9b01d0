//! # gxb-core: types, errors, and storage contracts for gxb-explorer.
//!
//! - [`types`]: endpoints, connection states, chain objects, blocks, index records
//! - [`error`]: the error taxonomy shared by every crate
//! - [`store`]: the [`store::KeyValueStore`] trait and an in-memory store
//! - [`constants`]: well-known object ids and service defaults

pub mod constants;
pub mod error;
pub mod store;
pub mod types;

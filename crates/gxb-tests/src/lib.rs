//! Integration test suite for gxb-explorer.
//!
//! Runs the explorer against scripted mock witnesses and checks the
//! connectivity, mirroring, and indexing guarantees end to end.

pub mod helpers;

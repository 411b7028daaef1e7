//! Integration tests module
//!
//! End-to-end tests running a coordination store, masters, nodes and a
//! client inside one process:
//! - Index deployment, replication and removal
//! - Distributed queries and result merging
//! - Node loss, session expiry and master failover

pub mod cluster_test;
pub mod failure_test;
pub mod fixtures;
pub mod query_test;

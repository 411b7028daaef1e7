//! Integration tests entry point
//!
//! This file serves as the entry point for all integration tests.
//! It includes the integration_tests module which contains:
//! - Deployment and undeployment across an in-process cluster
//! - Distributed count, search and details through the client
//! - Failure detection, partial results and master failover

mod integration_tests;

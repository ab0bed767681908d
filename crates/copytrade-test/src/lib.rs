//! Copytrade Test - Shared test utilities for the gateway fleet.
//!
//! Mock collaborators (container runtime, broker connector, vault), follower
//! fixtures, and a harness that wires them into a
//! [`GatewayManager`](copytrade_gateway::GatewayManager).
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! copytrade-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use copytrade_test::{TestHarness, follower, test_config};
//!
//! #[tokio::test]
//! async fn launches_enabled_followers() {
//!     let harness = TestHarness::new(test_config(), [follower("f1")]);
//!     let report = harness.manager.start().await.unwrap();
//!     assert_eq!(report.started, vec!["f1"]);
//!     harness.manager.stop().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;

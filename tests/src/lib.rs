//! # Game Backend Test Suite
//!
//! Unified test crate for scenarios that span more than one crate.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── chat_flow.rs               # publish → filter → listener, through the runtime
//!     └── subscription_lifecycle.rs  # conflicts, replacement, teardown accounting
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p game-tests
//! cargo test -p game-tests integration::chat_flow
//! ```

pub mod integration;

//! Testing infrastructure for strand-core
//!
//! Every helper opens its store inside a fresh temporary directory so tests
//! can run in parallel without sharing files or LMDB environments.
//!
//! # Usage
//!
//! ```rust,no_run
//! use strand_core::testing::setup_test_store;
//!
//! #[test]
//! fn my_test() -> Result<(), strand_core::Error> {
//!     let (store, _ctx) = setup_test_store()?;
//!     let mut tx = store.begin();
//!     // ...
//!     Ok(())
//! }
//! ```

mod context;
mod store;

pub use context::TestContext;
pub use store::{commit, setup_test_store, setup_test_store_with};

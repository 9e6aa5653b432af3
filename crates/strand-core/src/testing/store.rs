//! Store helpers

use super::TestContext;
use crate::transaction::{StoreTransaction, Vote};
use crate::{GraphStore, Result, StoreConfig};

/// Open a store in a fresh temporary directory
pub fn setup_test_store() -> Result<(GraphStore, TestContext)> {
    setup_test_store_with(|_| {})
}

/// Like [`setup_test_store`], adjusting the configuration first
pub fn setup_test_store_with(
    adjust: impl FnOnce(&mut StoreConfig),
) -> Result<(GraphStore, TestContext)> {
    let ctx = TestContext::new();
    let mut config = ctx.config();
    adjust(&mut config);
    let store = GraphStore::open(config)?;
    Ok((store, ctx))
}

/// Prepare and commit `tx`, returning its vote
pub fn commit(tx: &mut StoreTransaction) -> Result<Vote> {
    let vote = tx.prepare()?;
    tx.commit()?;
    Ok(vote)
}

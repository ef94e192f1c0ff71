//! Marketplace operations.
//!
//! Every operation takes the store and the acting identity explicitly.
//! Validation and authorization that can be decided locally happen before
//! the first store call; the store re-checks what it owns.

pub mod activity;
pub mod admin;
pub mod attachments;
pub mod bidding;
pub mod chat;
pub mod comments;
pub mod conversations;
pub mod feed;
pub mod lifecycle;
pub mod likes;
pub mod notifications;
pub mod profiles;
pub mod ratings;
pub mod stats;
#[cfg(test)]
pub(crate) mod testing;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Store, StoreError, StoreExt};

/// Fetch a row by id, reporting a missing row as `NotFound("<what> not found")`.
pub(crate) async fn load<T: DeserializeOwned + Send>(
    store: &dyn Store,
    collection: Collection,
    id: Uuid,
    what: &str,
) -> MarketResult<T> {
    match store.get::<T>(collection, id).await {
        Ok(row) => Ok(row),
        Err(StoreError::NotFound(_)) => Err(MarketError::not_found(format!("{what} not found"))),
        Err(e) => Err(e.into()),
    }
}

/// A fresh correlation key for server-side inserts that have none.
pub(crate) fn client_ref_or_new(client_ref: Option<String>) -> Option<String> {
    client_ref
        .filter(|r| !r.trim().is_empty())
        .or_else(|| Some(Uuid::new_v4().to_string()))
}

//! Live views
//!
//! A live view keeps an in-memory, ordered collection of one entity type in
//! step with the store. It merges three inputs:
//! - a baseline fetch
//! - the change stream for the same filter
//! - optimistic local mutations, reconciled when the store answers
//!
//! [`LiveCollection`] is the synchronous reconciliation core and
//! [`LiveView`] drives it from a subscription.

mod collection;
mod view;

pub use collection::{LiveCollection, StagedRemove, StagedUpdate};
pub use view::LiveView;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::store::Collection;

/// An entity that can be held in a live view.
pub trait LiveEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> Uuid;

    /// Correlation key linking an optimistic entity to its confirmed row.
    fn client_ref(&self) -> Option<&str> {
        None
    }

    /// Version stamp; older updates than the held one are dropped.
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

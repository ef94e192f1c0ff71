//! Admin verification
//!
//! Admins browse profiles and set their trust flags. Only admins change
//! `is_verified` or `is_admin`, and an admin cannot revoke their own role.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::auth::Actor;
use crate::domain::{AdminProfileUpdate, Profile};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Direction, Filter, Query, Store, StoreError, StoreExt};

fn require_admin(actor: &Actor) -> MarketResult<()> {
    if actor.is_active() && actor.profile.is_admin {
        Ok(())
    } else {
        Err(MarketError::forbidden("admin rights required"))
    }
}

pub async fn list_profiles(store: &dyn Store, actor: &Actor, search: Option<&str>) -> MarketResult<Vec<Profile>> {
    require_admin(actor)?;
    let mut query = Query::new(Collection::Profiles).order_by("full_name", Direction::Asc);
    if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
        query = query.filter(Filter::any(vec![
            Filter::contains("full_name", term),
            Filter::contains("username", term),
        ]));
    }
    Ok(store.fetch(&query).await?)
}

pub async fn update_flags(
    store: &dyn Store,
    actor: &Actor,
    profile_id: Uuid,
    update: AdminProfileUpdate,
) -> MarketResult<Profile> {
    require_admin(actor)?;
    if profile_id == actor.id() && update.is_admin == Some(false) {
        return Err(MarketError::conflict("admins cannot revoke their own admin role"));
    }

    let mut patch = Map::new();
    if let Some(verified) = update.is_verified {
        patch.insert("is_verified".into(), json!(verified));
    }
    if let Some(admin) = update.is_admin {
        patch.insert("is_admin".into(), json!(admin));
    }
    if patch.is_empty() {
        return Err(MarketError::validation("nothing to update"));
    }
    patch.insert("updated_at".into(), json!(Utc::now()));

    tracing::info!(
        actor_id = %actor.id(),
        profile_id = %profile_id,
        is_verified = ?update.is_verified,
        is_admin = ?update.is_admin,
        "Updating profile flags"
    );
    match store
        .patch(Collection::Profiles, profile_id, Value::Object(patch), None)
        .await
    {
        Ok(profile) => Ok(profile),
        Err(StoreError::NotFound(_)) => Err(MarketError::not_found("Profile not found")),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{actor, market};

    async fn admin(store: &crate::store::MemoryStore, username: &str) -> Actor {
        let plain = actor(store, username).await;
        let promoted: Profile = store
            .patch(Collection::Profiles, plain.id(), json!({ "is_admin": true }), None)
            .await
            .expect("promote");
        Actor::new(promoted)
    }

    #[tokio::test]
    async fn only_admins_see_or_change_flags() {
        let store = market();
        let ann = actor(&store, "ann").await;
        let ben = actor(&store, "ben").await;

        let listed = list_profiles(&store, &ann, None).await;
        assert!(matches!(listed, Err(MarketError::Authorization(_))));
        let update = AdminProfileUpdate { is_verified: Some(true), is_admin: None };
        let changed = update_flags(&store, &ann, ben.id(), update).await;
        assert!(matches!(changed, Err(MarketError::Authorization(_))));
    }

    #[tokio::test]
    async fn admins_verify_and_promote() {
        let store = market();
        let root = admin(&store, "root").await;
        let ben = actor(&store, "ben").await;

        let verified = update_flags(&store, &root, ben.id(), AdminProfileUpdate { is_verified: Some(true), is_admin: None })
            .await
            .expect("verify");
        assert!(verified.is_verified);
        assert!(!verified.is_admin);

        let promoted = update_flags(&store, &root, ben.id(), AdminProfileUpdate { is_verified: None, is_admin: Some(true) })
            .await
            .expect("promote");
        assert!(promoted.is_admin && promoted.is_verified);

        // the new admin can act straight away
        let ben = Actor::new(promoted);
        let unverified = update_flags(&store, &ben, root.id(), AdminProfileUpdate { is_verified: Some(false), is_admin: None })
            .await
            .expect("unverify");
        assert!(!unverified.is_verified);
    }

    #[tokio::test]
    async fn admins_keep_their_own_role() {
        let store = market();
        let root = admin(&store, "root").await;
        let result = update_flags(&store, &root, root.id(), AdminProfileUpdate { is_verified: None, is_admin: Some(false) }).await;
        assert!(matches!(result, Err(MarketError::Conflict(_))));

        let empty = update_flags(&store, &root, root.id(), AdminProfileUpdate::default()).await;
        assert!(matches!(empty, Err(MarketError::Validation(_))));
        let missing = update_flags(&store, &root, Uuid::new_v4(), AdminProfileUpdate { is_verified: Some(true), is_admin: None }).await;
        assert!(matches!(missing, Err(MarketError::NotFound(_))));
    }

    #[tokio::test]
    async fn search_matches_name_or_username() {
        let store = market();
        let root = admin(&store, "root").await;
        actor(&store, "marie_c").await;
        actor(&store, "alan").await;

        let all = list_profiles(&store, &root, Some("  ")).await.expect("all");
        assert_eq!(all.len(), 3);
        let found = list_profiles(&store, &root, Some("MARIE")).await.expect("search");
        assert_eq!(found.iter().map(|p| p.username.as_str()).collect::<Vec<_>>(), vec!["marie_c"]);
    }
}

//! Profiles: creation, lookup and the joins other services rely on.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use super::load;
use crate::auth::{Actor, AuthContext};
use crate::domain::{Profile, ProfileStatus, ProfileSummary, UpsertProfileRequest};
use crate::error::{MarketError, MarketResult};
use crate::store::{Collection, Filter, ObjectStorage, Query, Store, StoreExt};

const MAX_USERNAME_LEN: usize = 32;
const AVATAR_BUCKET: &str = "avatars";

fn clean_username(raw: &str) -> MarketResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(MarketError::validation("username must not be empty"));
    }
    if name.chars().count() > MAX_USERNAME_LEN {
        return Err(MarketError::validation(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn clean_skills(skills: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for skill in skills {
        let skill = skill.trim().to_lowercase();
        if !skill.is_empty() && !out.contains(&skill) {
            out.push(skill);
        }
    }
    out
}

pub async fn find_by_user(store: &dyn Store, user_id: Uuid) -> MarketResult<Option<Profile>> {
    let query = Query::new(Collection::Profiles).filter(Filter::eq("user_id", user_id));
    Ok(store.fetch_one(&query).await?)
}

pub async fn get_profile(store: &dyn Store, id: Uuid) -> MarketResult<Profile> {
    load(store, Collection::Profiles, id, "Profile").await
}

/// Create the caller's profile on first use, update it afterwards.
pub async fn upsert_profile(
    store: &dyn Store,
    auth: &AuthContext,
    req: UpsertProfileRequest,
) -> MarketResult<Profile> {
    match find_by_user(store, auth.user_id).await? {
        None => {
            let fallback = auth
                .email
                .as_deref()
                .and_then(|e| e.split('@').next())
                .unwrap_or("user")
                .to_string();
            let username = clean_username(req.username.as_deref().unwrap_or(&fallback))?;
            let now = Utc::now();
            let profile = Profile {
                id: Uuid::new_v4(),
                user_id: auth.user_id,
                username,
                full_name: req.full_name.unwrap_or_default().trim().to_string(),
                avatar_url: None,
                bio: req.bio.unwrap_or_default(),
                skills: clean_skills(req.skills.unwrap_or_default()),
                rating: 0.0,
                completed_tasks: 0,
                status: ProfileStatus::Active,
                is_verified: false,
                is_admin: false,
                created_at: now,
                updated_at: now,
            };
            tracing::info!(user_id = %auth.user_id, profile_id = %profile.id, "Creating profile");
            Ok(store.create(Collection::Profiles, &profile).await?)
        }
        Some(existing) => {
            let mut patch = Map::new();
            if let Some(username) = req.username {
                patch.insert("username".into(), json!(clean_username(&username)?));
            }
            if let Some(full_name) = req.full_name {
                patch.insert("full_name".into(), json!(full_name.trim()));
            }
            if let Some(bio) = req.bio {
                patch.insert("bio".into(), json!(bio));
            }
            if let Some(skills) = req.skills {
                patch.insert("skills".into(), json!(clean_skills(skills)));
            }
            if patch.is_empty() {
                return Ok(existing);
            }
            patch.insert("updated_at".into(), json!(Utc::now()));
            tracing::info!(profile_id = %existing.id, "Updating profile");
            Ok(store
                .patch(Collection::Profiles, existing.id, Value::Object(patch), None)
                .await?)
        }
    }
}

/// Public summaries for `ids`, keyed by profile id. Unknown ids are skipped.
pub async fn summaries(
    store: &dyn Store,
    ids: impl IntoIterator<Item = Uuid>,
) -> MarketResult<HashMap<Uuid, ProfileSummary>> {
    let mut ids: Vec<Uuid> = ids.into_iter().collect();
    ids.sort();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let query = Query::new(Collection::Profiles).filter(Filter::is_in("id", ids));
    let profiles: Vec<Profile> = store.fetch(&query).await?;
    Ok(profiles
        .iter()
        .map(|p| (p.id, ProfileSummary::from(p)))
        .collect())
}

fn image_extension(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

pub async fn upload_avatar(
    store: &dyn Store,
    objects: &dyn ObjectStorage,
    actor: &Actor,
    bytes: Vec<u8>,
    content_type: &str,
    max_bytes: usize,
) -> MarketResult<Profile> {
    let ext = image_extension(content_type)
        .ok_or_else(|| MarketError::validation("avatar must be a PNG, JPEG, WebP or GIF image"))?;
    if bytes.is_empty() {
        return Err(MarketError::validation("avatar file is empty"));
    }
    if bytes.len() > max_bytes {
        return Err(MarketError::validation(format!(
            "avatar exceeds the {max_bytes} byte limit"
        )));
    }

    let path = format!("{}/{}.{}", actor.id(), Uuid::new_v4(), ext);
    let url = objects.upload(AVATAR_BUCKET, &path, bytes, content_type).await?;
    tracing::info!(profile_id = %actor.id(), path = %path, "Avatar uploaded");

    Ok(store
        .patch(
            Collection::Profiles,
            actor.id(),
            json!({ "avatar_url": url, "updated_at": Utc::now() }),
            None,
        )
        .await?)
}

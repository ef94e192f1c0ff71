use super::Claims;
use crate::domain::Profile;
use uuid::Uuid;

/// Authenticated user context extracted from JWT
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Auth user ID (from JWT sub claim)
    pub user_id: Uuid,

    /// User email if available
    pub email: Option<String>,

    /// User role if specified
    pub role: Option<String>,
}

impl AuthContext {
    pub fn from_claims(claims: &Claims) -> Result<Self, &'static str> {
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| "Invalid user ID in token")?;

        Ok(Self {
            user_id,
            email: claims.email.clone(),
            role: claims.role.clone(),
        })
    }
}

/// The marketplace identity acting on a request: an authenticated user with
/// a profile.
#[derive(Debug, Clone)]
pub struct Actor {
    pub profile: Profile,
}

impl Actor {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    /// Profile id; every ownership column references it.
    pub fn id(&self) -> Uuid {
        self.profile.id
    }

    pub fn is_active(&self) -> bool {
        self.profile.is_active()
    }
}

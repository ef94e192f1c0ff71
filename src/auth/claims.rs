use serde::{Deserialize, Serialize};

/// JWT claims issued by Supabase Auth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (auth user ID)
    pub sub: String,

    /// Audience
    pub aud: String,

    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,

    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: Option<i64>,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// User email - optional
    #[serde(default)]
    pub email: Option<String>,

    /// User role - optional
    #[serde(default)]
    pub role: Option<String>,

    /// User metadata from Supabase - optional
    #[serde(default)]
    pub user_metadata: Option<serde_json::Value>,
}

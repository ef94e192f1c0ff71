pub mod claims;
pub mod context;
pub mod middleware;
pub mod verifier;

pub use claims::Claims;
pub use context::{Actor, AuthContext};
pub use middleware::{RequireActor, RequireAuth};
pub use verifier::JwtVerifier;

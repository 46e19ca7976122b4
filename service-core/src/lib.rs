//! service-core: HTTP, identity and observability plumbing shared by the
//! storefront services.
pub mod config;
pub mod error;
pub mod extract;
pub mod identity;
pub mod middleware;
pub mod observability;

pub use error::AppError;
pub use extract::JsonBody;
pub use identity::{IdentityVerifier, JwtAlgorithm, Role, VerifiedIdentity};

pub mod auth;
pub mod metrics;
pub mod security_headers;
pub mod tracing;

pub use auth::{AdminUser, AuthUser, require_identity};
pub use metrics::metrics_middleware;
pub use security_headers::security_headers_middleware;
pub use tracing::{REQUEST_ID_HEADER, request_id_middleware};

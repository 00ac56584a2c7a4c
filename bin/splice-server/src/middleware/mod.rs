mod auth;
mod trace;

pub use auth::{check_api_auth, CurrentUser};
pub use trace::trace_requests;

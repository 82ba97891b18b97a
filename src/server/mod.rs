mod error;
mod http;
mod middleware;

pub use error::ApiError;
pub use http::{AppState, Server, build_router};
pub use middleware::ClientIp;

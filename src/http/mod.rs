//! HTTP surface: the admission middleware, routes, and server loop.

mod handlers;
mod middleware;
mod server;

pub use middleware::{
    admission_middleware, client_address, rate_limited_response, request_token, AdmissionState,
    RATE_LIMIT_EXCEEDED_MESSAGE,
};
pub use server::{build_router, HttpServer};

pub mod metrics;
pub mod panic;
pub mod rate_limit;
pub mod security_headers;
pub mod tracing;

pub mod concurrency;
pub mod decision;
pub mod gate;
pub mod hooks;
pub mod key_record;
pub mod keystore;
pub mod quota;
pub mod rate_limiter;
pub mod redis_rate_limiter;
pub mod reservation;
pub mod usage_meter;

pub use gate::{CallContext, Gate, GateConfig, ToolCall, ToolPricing};
pub use keystore::KeyStore;

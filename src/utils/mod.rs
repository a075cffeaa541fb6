pub mod ip_match;
pub mod json_safety;
pub mod log_sanitizer;

pub use log_sanitizer::*;

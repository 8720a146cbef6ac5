//! The message registry and everything it owns: reference tables and pending requests.

pub mod context;
pub mod refs;
pub mod request;

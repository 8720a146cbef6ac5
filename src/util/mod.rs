pub mod backoff;
pub mod cancel;
pub mod rate;
pub mod rolling_data;
pub mod safe_converter;

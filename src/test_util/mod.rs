//! Message variants and a tracking connection for tests. They are used for testing the relay
//!  core itself, but they are also exported for testing application handlers against it.

pub mod connection;
pub mod message;

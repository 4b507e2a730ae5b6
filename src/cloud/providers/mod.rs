//! Cloud connector implementations

pub mod http;

pub use http::*;

//! Test doubles for running the bridge without a broker or cloud platform

pub mod mocks;

pub use mocks::*;

//! Test utilities shared by the integration tests

#![allow(dead_code)]

pub mod registry;

pub use registry::*;

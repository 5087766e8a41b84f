//! Registry implementations for listing tags and pulling images

pub mod export;
pub mod oci;

pub use oci::OciRegistry;

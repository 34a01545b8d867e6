#![forbid(unsafe_code)]

pub use error::Error;

pub mod bin_serde;
pub mod error;

//! HTTP request handlers for the object data plane.

pub mod download;
pub mod upload;

//! HTTP route handlers

pub mod alerts;
pub mod sensors;

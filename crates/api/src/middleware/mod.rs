//! Request extractors shared by API handlers.

pub mod auth;

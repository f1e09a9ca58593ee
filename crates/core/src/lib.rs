pub mod archive;
pub mod channels;
pub mod error;
pub mod jobs;
pub mod protocol;
pub mod roles;
pub mod types;

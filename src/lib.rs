//! Discord Forum Mirror library.
//!
//! A service that mirrors a Discord server's forum channels into a relational
//! store so the content becomes durable, searchable, and publishable. Author
//! identities are one-way hashed, content is sanitized and converted to HTML,
//! and attachments are transcoded to WebP and uploaded to S3.

pub mod config;
pub mod constants;
pub mod db;
pub mod hasher;
pub mod live;
pub mod media;
pub mod platform;
pub mod s3;
pub mod sanitize;
pub mod slug;
pub mod staff;
pub mod sync;

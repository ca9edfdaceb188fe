//! Strata - timelines and cursors for partitioned event streams
//!
//! A logical event log per event type, made of consecutive timelines that
//! each live on their own physical log. Publishing can be switched to a new
//! physical log at any time; readers keep their positions and cross timeline
//! boundaries transparently.

pub mod config;
pub mod cursor;
pub mod facade;
pub mod lock;
pub mod publisher;
pub mod storage;
pub mod stream;
pub mod timeline;
pub mod utils;

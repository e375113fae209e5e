//! # sharecast-host — screen-share host service
//!
//! Opens a sharing session, prints its invitation code, streams the
//! captured screen through the keyframe/delta encoder and serves
//! viewers over TCP until stopped.

pub mod config;
pub mod service;

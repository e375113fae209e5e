//! # sharecast-viewer — headless screen-share viewer
//!
//! Joins a host's session with an invitation code, decodes the frame
//! stream and reports stream statistics. Rendering the decoded raster
//! is left to an embedding display layer.

pub mod config;
pub mod watch;

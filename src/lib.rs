//! linearcast - linear TV channels from a media library
//!
//! Channels interleave a base source with additional sources into long
//! M3U playlists, regenerated incrementally as they play out, plus a
//! combined playlist and an XMLTV-style guide for the player.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod emitter;
pub mod error;
pub mod lock;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod storage;
mod xml;

pub use error::{Error, Result};

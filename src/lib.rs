//! lyrics-audit library - the layout, fetch and analyze stages plus the
//! shared modules used by both binaries.

pub mod analyze;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod files;
pub mod layout;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod safety;

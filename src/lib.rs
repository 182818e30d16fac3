//! Tracks how long your computer spends on each application, splitting the
//! time into foreground and background activity and classifying foreground
//! slices as typing or reading. Everything is aggregated at minute, hour
//! and day resolution into a local SQLite database that a reporting CLI
//! reads while the daemon keeps writing.

pub mod cli;
pub mod daemon;
pub mod system_api;
pub mod utils;

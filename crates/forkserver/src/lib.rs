// crates/forkserver/src/lib.rs

//! Client side of the sandfork fork server: a process-wide supervisor that
//! lazily starts one helper process and forwards spawn requests to it over
//! a private channel.

pub mod client;
pub mod error;
pub mod global;
pub mod image;
pub mod launch;
pub mod serve;
pub mod start_mode;

pub use client::ForkClient;
pub use error::{ConfigError, StartupError, SupervisorError};
pub use global::{DISABLE_ENV, GlobalForkClient, START_MODE_ENV, global};
pub use image::{HELPER_BIN_NAME, HELPER_PATH_ENV, HelperImage, InstalledImage};
pub use launch::{ForkLauncher, HelperHandle, Launcher};
pub use serve::serve;
pub use start_mode::{StartMode, StartModeSet, validate};

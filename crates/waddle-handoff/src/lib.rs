//! # waddle-handoff
//!
//! Listener inheritance and file descriptor handoff for graceful restarts.
//!
//! ## Overview
//!
//! A service asks a [`Net`] for its listeners instead of binding them itself:
//! 1. On first use, listeners passed down by the parent process are picked up
//!    from the inherited file descriptors (systemd socket activation compatible)
//! 2. Each `listen*` call claims a matching inherited listener, or binds a fresh one
//! 3. [`Net::start_process`] re-executes the current binary, handing it every
//!    active listener so the new process repeats step 1
//! 4. The new process stops the old one with [`Net::kill`] once it is serving
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: Number of inherited file descriptors (starting at fd 3)
//! - `WADDLE_HANDOFF_PATH_PREFIX`: Prefix for locating the binary on restart
//! - `WADDLE_HANDOFF_BACKLOG`: Listen backlog for freshly bound sockets (default: 1024)
//!
//! ## Limitations
//!
//! Listeners are never closed by the registry. Once a listener has been handed
//! out it stays part of the active set (and is passed to the next process)
//! for the lifetime of the process.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("waddle-handoff requires a Unix platform (Linux or macOS)");

mod addr;
mod error;
mod inherit;
mod listener;
mod net;
mod once;
mod process;

pub use addr::{same_addr, ListenAddr, Network, TcpAddr, UnixAddr};
pub use error::{Error, Result};
pub use inherit::{LISTEN_FDS, LISTEN_FDS_START};
pub use listener::{Listener, UnixListener};
pub use net::{Net, NetBuilder};
pub use process::{capture_launch_context, LaunchContext};

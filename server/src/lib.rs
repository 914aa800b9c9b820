//! # MUD Runtime Core
//!
//! This library is the runtime underneath a text-based multi-user game
//! server: the part that keeps hundreds of telnet sessions alive, keeps a
//! bounded slice of a large persistent world in memory, and simulates only
//! the parts of that world someone can observe. Game commands proper sit
//! on top of it.
//!
//! ## Architecture
//!
//! ### Single-Threaded Tick
//! Everything runs on one thread inside a `current_thread` tokio runtime.
//! A fixed-rate interval drives `Server::tick`, which in order:
//! - accepts pending connections and starts hostname resolution
//! - reads whatever input each socket has ready, never blocking
//! - disconnects sessions idle past their role's limit
//! - dispatches at most one command per connection, in random order
//! - simulates every tracked entity once
//! - reaps finished worker processes and routes their output
//! - flushes output and retires disconnected sessions
//!
//! World objects are `Rc<RefCell<_>>` handles. Components that only need to
//! find an object (the identifier registry, the scheduler) hold `Weak`
//! handles and notice when the object is gone.
//!
//! ### Workers
//! Blocking work (reverse DNS, directory listings, data audits) runs in a
//! child process: the server binary started again with its `worker`
//! subcommand. A small tokio task per worker forwards stdout lines and the
//! exit status back to the tick, which never waits on a child.
//!
//! ### Live Reboot
//! An operator can replace the running program without dropping players.
//! Listening sockets and player connections survive `exec`; the new image
//! finds them in a reboot record, reloads the players and carries on.
//!
//! ## Module Organization
//!
//! - `config`: TOML configuration with command-line overrides
//! - `error`: the `ServerError` taxonomy
//! - `world`: rooms, mobiles, items and players
//! - `ids`: globally unique identifiers and the live lookup table
//! - `cache`: bounded LRU pools over durable storage
//! - `store`: bincode files on disk
//! - `scheduler`: the active list of simulated entities
//! - `telnet`, `connection`, `connections`: the session layer
//! - `dns`: hostname cache with expiry
//! - `workers`, `jobs`: child-process supervision and what children run
//! - `server`, `reboot`: the main loop and process replacement
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::server::{Exit, Server};
//! use server::store::Collaborators;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let collaborators = Collaborators::file_backed(&config.data_dir, config.start_room.clone());
//!     let mut server = Server::bind(config, collaborators)?;
//!
//!     match server.run().await? {
//!         Exit::Shutdown => Ok(()),
//!         Exit::Reboot(handoff) => Err(handoff.exec().into()),
//!     }
//! }
//! ```

pub mod cache;
mod commands;
pub mod config;
pub mod connection;
pub mod connections;
pub mod dns;
pub mod error;
pub mod ids;
pub mod jobs;
pub mod reboot;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod telnet;
pub mod workers;
pub mod world;

pub use error::{Result, ServerError};

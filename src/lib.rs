//! # tuya-relay
//!
//! Local HTTP relay that switches Tuya outlets on and off over the LAN,
//! discovering a device's IP from its identifier when the caller does not
//! know it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuya_relay::{AppState, DeviceDirectory, Dispatcher, Scanner, TuyaLink, router};
//! use std::time::Duration;
//!
//! # async fn run() -> std::io::Result<()> {
//! let directory = DeviceDirectory::new(Scanner::new());
//! let dispatcher = Dispatcher::new(directory, TuyaLink::default(), "HOME");
//! let app = router(AppState::new(dispatcher, 8, Duration::from_secs(45)));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod config;
pub mod crypto;
pub mod device;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod scanner;
pub mod server;

pub use config::Config;
pub use device::{Action, Device, DeviceControl, Target, TuyaLink};
pub use directory::DeviceDirectory;
pub use dispatcher::{CommandRequest, Dispatcher};
pub use error::{DispatchError, TuyaError};
pub use protocol::{CommandType, Version};
pub use scanner::{Discovery, DiscoveryResult, Scanner};
pub use server::{AppState, router};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

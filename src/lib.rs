//! This crate provides a way to flash and manage Tock Binary Format
//! applications on a microcontroller running the Tock bootloader, talking to
//! it over a serial port.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use tbf_flash::client::BootloaderClient;
//! use tbf_flash::flash::DEFAULT_APP_ADDRESS;
//! use tbf_flash::operations;
//! use tbf_flash::transport::Transport;
//! use std::fs::File;
//! use std::io::Read;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut file = File::open("app.tab")?;
//! let mut image = Vec::new();
//! file.read_to_end(&mut image)?;
//!
//! let transport = Transport::open(None)?;
//! let client = BootloaderClient::new(transport);
//! let mut client = client.enter().map_err(|(_, e)| e)?;
//!
//! operations::flash(&mut client, &image, DEFAULT_APP_ADDRESS)?;
//! client.exit();
//! # Ok(())
//! # }
//! ```

pub mod app_header;
pub mod bundle;
pub mod client;
pub mod error;
pub mod flash;
pub mod framer;
pub mod operations;
pub mod transport;
pub mod walker;

pub use bundle::{AppBundle, AppVariant};
pub use client::BootloaderClient;
pub use error::{Error, Result};
pub use transport::Transport;
pub use walker::{FlashAppWalker, InstalledApp};

//! nodepm core - platform-independent process contract
//!
//! This crate provides the message protocol, the `Process` and `Channel`
//! traits, configuration and error types shared by every execution model,
//! and the adapter that runs plain functions as processes.

mod codec;
mod config;
mod error;
mod internal;
mod process;
mod stream;

pub use codec::*;
pub use config::*;
pub use error::*;
pub use internal::*;
pub use process::*;
pub use stream::*;

pub use nix::sys::signal::Signal;

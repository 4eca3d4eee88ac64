//! termxfer: file transfer over a terminal's escape-code channel.

pub mod config;
pub mod delta;
pub mod error;
pub mod transfer;

pub use error::{Result, TransferError};

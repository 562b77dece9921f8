#![cfg_attr(docsrs, feature(doc_cfg))]
//! # litimebms_lib
//!
//! This crate provides a library for reading LiTime (and compatible) LiFePO4
//! BMS devices over Bluetooth Low Energy.
//! It builds command frames, decodes status notifications, derives battery
//! metrics and keeps a poll loop alive over an unreliable single-client link.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `litimebms` command-line tool.
//!
//! ### Transport Features
//! - `btleplug`: Enables [`btleplug_transport::BtleplugTransport`], a BLE transport using the `btleplug` crate.
//!   Without it the library only provides the [`transport::BleTransport`] trait to implement.
//!
//! ### Utility Features
//! - `bin-dependencies`: Enables all features required by the `litimebms` binary executable (currently `btleplug`).

/// Poll configuration and timeouts.
pub mod config;
/// Polling controller and the state it publishes.
pub mod controller;
/// Contains error types for the library.
mod error;
/// Metrics derived from status frames.
pub mod metrics;
/// Defines the communication protocol for LiTime BMS.
pub mod protocol;
/// Connection handling for one device.
pub mod session;
/// The BLE capability used by the session.
pub mod transport;

/// BLE transport backed by `btleplug`.
#[cfg_attr(docsrs, doc(cfg(feature = "btleplug")))]
#[cfg(feature = "btleplug")]
pub mod btleplug_transport;

pub use error::{DecodeError, Error, TransportError};

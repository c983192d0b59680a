//! Core types shared by the PeerLink transport, kernel and CLI.
//!
//! This crate defines the message model exchanged between platforms, the
//! network events raised by the transport, and the configuration surface.
//! It contains no I/O.

pub mod config;
pub mod error;
pub mod event;
pub mod message;

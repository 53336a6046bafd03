#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pylonbms_lib
//!
//! This crate decodes the CAN bus telemetry of Pylontech compatible battery
//! management systems. Frames are classified by identifier, their fields are
//! decoded and accumulated into a [`BmsSnapshot`] by the [`Assembler`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pylonbms` command-line tool and pulls in `socketcan` and `serde`.
//!
//! ### Transport Features
//! - `socketcan`: Enables the blocking Linux SocketCAN transport.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing the decoded snapshot.
//! - `bin-dependencies`: Enables all features required by the `pylonbms` binary executable.

/// Contains error types for the library.
mod error;
/// Reassembly of frames into snapshots.
pub mod assembler;
/// Scaled integer, flag and text fields.
pub mod codec;
/// Frame identifiers, classification and the poll request.
pub mod protocol;
/// The decoded BMS state.
pub mod snapshot;

pub use assembler::{Assembler, Outcome, Stats};
pub use error::{Error, Result};
pub use protocol::{build_poll_request, classify, FrameKind, RawFrame};
pub use snapshot::BmsSnapshot;

/// Blocking transport over Linux SocketCAN.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod transport;

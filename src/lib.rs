//! Host-side control and readout for FalconX digital pulse processors.
//!
//! A [`Module`] owns one TCP connection to a card, a receiver thread that
//! applies pushed data to per-channel state, and the output formatters of the
//! current run. Acquisition values are addressed by name through the
//! registry; run data and board operations likewise.

pub mod binner;
pub mod buffer;
pub mod calibration;
pub mod card_params;
pub mod channel;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod discovery;
pub mod error;
pub mod listmode;
pub mod mapping;
pub mod mca;
pub mod module;
mod receiver;
pub mod registry;
pub mod rundata;
pub mod stats;
pub mod transport;
pub mod tui;
pub mod utils;

pub use config::Conf;
pub use discovery::{discover, DiscoveredCard};
pub use error::{ErrorKind, PslError, PslResult};
pub use module::{CharacterizationStatus, FirmwareSet, Module, ModuleOptions};
pub use rundata::DataValue;
pub use utils::Counter;

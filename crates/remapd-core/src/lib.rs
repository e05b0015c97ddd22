// Remapd Core Library
// Event remapping and device multiplexing engine

pub mod config;
pub mod discovery;
pub mod engine;
pub mod mapping;
pub mod multiplexer;
pub mod output;
pub mod session;

pub use config::{Config, ConfigError};
pub use discovery::DeviceInfo;
pub use engine::{Emission, RemapEngine};
pub use mapping::{DeviceGroup, DeviceSelector, MappingTable, OutputAction, RemapRule};
pub use multiplexer::{Multiplexer, MultiplexerError};
pub use output::{MirroredCaps, UInputError, VirtualOutput};
pub use session::{DeviceSession, SessionError};

//! # QLaser Core Library
//!
//! Host-side control of the QLaser FPGA pulse sequencer.
//!
//! This library provides:
//! - Waveform synthesis (polynomial pulse shapes, sample tables, DC DAC codes)
//! - The serial command protocol and pulse definition register codec
//! - A device session for the version handshake, channel selection and
//!   table/definition management
//! - A wave library and sequence loader on top of the session
//! - A simulated instrument for offline runs
//!
//! ## Supported firmware
//!
//! - Legacy two-step protocol (`ProtocolProfile::legacy()`)
//! - Unified packed protocol (`ProtocolProfile::unified()`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use qlaser_core::prelude::*;
//!
//! let config = SessionConfig::from_file("qlaser.json")?;
//! let mut session = Session::new(config);
//! session.connect(&SerialOpener)?;
//!
//! let mut library = WaveLibrary::new(JsonlWaveStore::open("data/wavetables.jsonl")?);
//! let samples = Synthesizer::default().synthesize_table(64, &[1.0, 0.5], session.sink());
//! let wave = library.add_wave(&mut session, &samples, true)?;
//!
//! session.select_channel(ChannelSelection::One(3))?;
//! session.append_pulse_definition(&PulseConfig::new(10, wave, 1.0, 1.0, 0))?;
//! session.trigger()?;
//! ```

pub mod config;
pub mod library;
pub mod loader;
pub mod protocol;
pub mod report;
pub mod sim;
pub mod storage;
pub mod waveform;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::library::WaveLibrary;
    pub use crate::loader::{load_waves, set_definitions, LoadOptions, TimeBase, WaveEntry};
    pub use crate::protocol::{
        ChannelSelection, LinkDescriptor, ProtocolError, ProtocolProfile, PulseConfig, SerialOpener,
        Session, SessionState, Strictness, WaveId,
    };
    pub use crate::report::{MemorySink, ReportSink, Severity, TracingSink};
    pub use crate::sim::SimulatedInstrument;
    pub use crate::storage::{
        DefinitionStore, JsonlDefinitionStore, JsonlWaveStore, MemoryDefinitionStore, MemoryWaveStore,
        WaveStore,
    };
    pub use crate::waveform::{voltage_to_dac_code, DacReference, PulseShape, Synthesizer, WaveSample};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

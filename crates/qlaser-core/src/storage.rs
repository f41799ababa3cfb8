//! Waveform and pulse definition history
//!
//! Append-only record of every waveform table written through the
//! [`WaveLibrary`](crate::library::WaveLibrary). The instrument has no way to
//! list what its RAM holds, so the store is the only source for the next free
//! address.
//!
//! [`DefinitionStore`] keeps every definition set loaded onto a channel by
//! [`set_definitions`](crate::loader::set_definitions).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::protocol::{ProtocolError, PulseConfig, WaveId};
use crate::waveform::WaveSample;

/// One stored waveform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveRecord {
    pub id: WaveId,
    pub samples: Vec<WaveSample>,
    pub stored_at: DateTime<Utc>,
}

/// Waveform history
pub trait WaveStore {
    /// Record the samples written under `id`
    fn append(&mut self, id: WaveId, samples: &[WaveSample]) -> Result<(), ProtocolError>;

    /// Samples stored under `id`; the latest record wins
    fn lookup(&self, id: WaveId) -> Result<Option<Vec<WaveSample>>, ProtocolError>;

    /// Ids in insertion order
    fn ids(&self) -> Vec<WaveId>;

    fn last_id(&self) -> Option<WaveId> {
        self.ids().last().copied()
    }

    /// Forget every record
    fn clear(&mut self) -> Result<(), ProtocolError>;
}

/// In-memory store
#[derive(Debug, Default, Clone)]
pub struct MemoryWaveStore {
    records: Vec<WaveRecord>,
}

impl MemoryWaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[WaveRecord] {
        &self.records
    }
}

impl WaveStore for MemoryWaveStore {
    fn append(&mut self, id: WaveId, samples: &[WaveSample]) -> Result<(), ProtocolError> {
        self.records.push(WaveRecord {
            id,
            samples: samples.to_vec(),
            stored_at: Utc::now(),
        });
        Ok(())
    }

    fn lookup(&self, id: WaveId) -> Result<Option<Vec<WaveSample>>, ProtocolError> {
        Ok(find(&self.records, id))
    }

    fn ids(&self) -> Vec<WaveId> {
        self.records.iter().map(|r| r.id).collect()
    }

    fn clear(&mut self) -> Result<(), ProtocolError> {
        self.records.clear();
        Ok(())
    }
}

/// Store backed by a JSON Lines file, one [`WaveRecord`] per line
#[derive(Debug)]
pub struct JsonlWaveStore {
    path: PathBuf,
    records: Vec<WaveRecord>,
}

impl JsonlWaveStore {
    /// Open `path`, creating the parent directory. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path)?;
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[WaveRecord] {
        &self.records
    }
}

impl WaveStore for JsonlWaveStore {
    fn append(&mut self, id: WaveId, samples: &[WaveSample]) -> Result<(), ProtocolError> {
        let record = WaveRecord {
            id,
            samples: samples.to_vec(),
            stored_at: Utc::now(),
        };
        append_record(&self.path, &record)?;
        self.records.push(record);
        Ok(())
    }

    fn lookup(&self, id: WaveId) -> Result<Option<Vec<WaveSample>>, ProtocolError> {
        Ok(find(&self.records, id))
    }

    fn ids(&self) -> Vec<WaveId> {
        self.records.iter().map(|r| r.id).collect()
    }

    fn clear(&mut self) -> Result<(), ProtocolError> {
        File::create(&self.path)?;
        self.records.clear();
        Ok(())
    }
}

fn find(records: &[WaveRecord], id: WaveId) -> Option<Vec<WaveSample>> {
    records
        .iter()
        .rev()
        .find(|r| r.id == id)
        .map(|r| r.samples.clone())
}

/// One definition set loaded onto a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub channel: u32,
    pub sequence_length: u32,
    pub definitions: Vec<PulseConfig>,
    pub stored_at: DateTime<Utc>,
}

/// Pulse definition history
pub trait DefinitionStore {
    /// Record `definitions` as the contents of `channel`
    fn append(
        &mut self,
        channel: u32,
        sequence_length: u32,
        definitions: &[PulseConfig],
    ) -> Result<(), ProtocolError>;

    /// Every record in insertion order
    fn records(&self) -> &[DefinitionRecord];

    /// Most recent definition set of `channel`
    fn latest(&self, channel: u32) -> Option<&DefinitionRecord> {
        self.records().iter().rev().find(|r| r.channel == channel)
    }
}

/// In-memory definition history
#[derive(Debug, Default, Clone)]
pub struct MemoryDefinitionStore {
    records: Vec<DefinitionRecord>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionStore for MemoryDefinitionStore {
    fn append(
        &mut self,
        channel: u32,
        sequence_length: u32,
        definitions: &[PulseConfig],
    ) -> Result<(), ProtocolError> {
        self.records.push(DefinitionRecord {
            channel,
            sequence_length,
            definitions: definitions.to_vec(),
            stored_at: Utc::now(),
        });
        Ok(())
    }

    fn records(&self) -> &[DefinitionRecord] {
        &self.records
    }
}

/// Definition history in a JSON Lines file, one [`DefinitionRecord`] per line
#[derive(Debug)]
pub struct JsonlDefinitionStore {
    path: PathBuf,
    records: Vec<DefinitionRecord>,
}

impl JsonlDefinitionStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref().to_path_buf();
        let records = load_records(&path)?;
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DefinitionStore for JsonlDefinitionStore {
    fn append(
        &mut self,
        channel: u32,
        sequence_length: u32,
        definitions: &[PulseConfig],
    ) -> Result<(), ProtocolError> {
        let record = DefinitionRecord {
            channel,
            sequence_length,
            definitions: definitions.to_vec(),
            stored_at: Utc::now(),
        };
        append_record(&self.path, &record)?;
        self.records.push(record);
        Ok(())
    }

    fn records(&self) -> &[DefinitionRecord] {
        &self.records
    }
}

/// Read every record of a JSON Lines file, creating the parent directory.
/// A missing file holds no records.
fn load_records<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, ProtocolError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut records = Vec::new();
    if !path.exists() {
        return Ok(records);
    }
    let reader = BufReader::new(File::open(path)?);
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            ProtocolError::Storage(format!("{} line {}: {}", path.display(), number + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn append_record<R: Serialize>(path: &Path, record: &R) -> Result<(), ProtocolError> {
    let line = serde_json::to_string(record).map_err(|e| ProtocolError::Storage(e.to_string()))?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", line)?;
    writer.flush()?;
    Ok(())
}

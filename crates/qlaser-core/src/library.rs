//! Wave library
//!
//! Packs waveform tables one after another into waveform RAM and keeps the
//! history in a [`WaveStore`]. Tables are broadcast to every channel, so a
//! [`WaveId`] is valid on all of them.

use tracing::{debug, info};

use crate::protocol::{ChannelSelection, ProtocolError, Session, WaveId};
use crate::storage::WaveStore;
use crate::waveform::WaveSample;

/// Waveform RAM allocator over a history store
pub struct WaveLibrary<S: WaveStore> {
    store: S,
}

impl<S: WaveStore> WaveLibrary<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Ids of every stored waveform
    pub fn wave_ids(&self) -> Vec<WaveId> {
        self.store.ids()
    }

    /// Next free even address after the last stored waveform
    pub fn next_start_address(&self) -> u32 {
        let end = self.store.last_id().map(|id| id.end_address()).unwrap_or(0);
        end + end % 2
    }

    /// Write `samples` to every channel after the last stored waveform.
    ///
    /// With `keep_previous == false` waveform RAM and the store are cleared
    /// first and the table lands at address 0.
    pub fn add_wave(
        &mut self,
        session: &mut Session,
        samples: &[WaveSample],
        keep_previous: bool,
    ) -> Result<WaveId, ProtocolError> {
        let start = if keep_previous {
            self.next_start_address()
        } else {
            0
        };
        let capacity = session.profile().wave_capacity;
        let end = start as u64 + samples.len() as u64;
        if end > capacity as u64 {
            return Err(ProtocolError::InvalidAddress {
                field: "waveform end address",
                value: end,
                limit: capacity as u64,
            });
        }

        if !keep_previous {
            info!("add_wave: clearing waveform RAM");
            session.select_channel(ChannelSelection::All)?;
            session.clear_waveform_table()?;
            self.store.clear()?;
        }

        let id = WaveId::new(start as u16, samples.len() as u16);
        session.write_waveform_table(start, samples, true)?;
        self.store.append(id, samples)?;
        debug!("add_wave: wave {} at address {}", id, start);
        Ok(id)
    }

    /// Read a stored waveform back from the instrument
    pub fn get_wave(&self, session: &mut Session, id: WaveId) -> Result<Vec<WaveSample>, ProtocolError> {
        if !self.store.ids().contains(&id) {
            return Err(ProtocolError::Storage(format!("waveform {} not found", id)));
        }
        session.read_waveform_table(id.start_address as u32, id.length as usize)
    }
}

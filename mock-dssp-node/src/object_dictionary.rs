//! Object Dictionary for the mock gateway node
//!
//! This module defines the simulated object dictionary with test data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dssp_common::{ErrorCode, PayloadType};
use rand::Rng;
use tracing::info;

/// Represents a single entry in the object dictionary
pub enum ObjectEntry {
    /// Stored value, optionally writable from the host
    Static {
        data: Vec<u8>,
        payload_type: PayloadType,
        writable: bool,
    },
    /// Read-only value generated on each read
    Dynamic(Box<dyn Fn() -> Vec<u8> + Send + Sync>, PayloadType),
}

/// Object dictionary mapping (index, subindex) to values
#[derive(Default)]
pub struct ObjectDictionary {
    entries: HashMap<(u16, u8), ObjectEntry>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read-only entry to the dictionary
    pub fn add_static(&mut self, index: u16, subindex: u8, data: Vec<u8>, payload_type: PayloadType) {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Static { data, payload_type, writable: false },
        );
    }

    /// Add an entry the host may overwrite
    pub fn add_writable(&mut self, index: u16, subindex: u8, data: Vec<u8>, payload_type: PayloadType) {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Static { data, payload_type, writable: true },
        );
    }

    /// Add a dynamic entry (value generated on each read)
    pub fn add_dynamic<F>(&mut self, index: u16, subindex: u8, generator: F, payload_type: PayloadType)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.entries.insert(
            (index, subindex),
            ObjectEntry::Dynamic(Box::new(generator), payload_type),
        );
    }

    /// Get an entry from the dictionary
    pub fn get(&self, index: u16, subindex: u8) -> Option<(Vec<u8>, PayloadType)> {
        self.entries.get(&(index, subindex)).map(|entry| match entry {
            ObjectEntry::Static { data, payload_type, .. } => (data.clone(), *payload_type),
            ObjectEntry::Dynamic(generator, payload_type) => (generator(), *payload_type),
        })
    }

    /// Store `data` into a writable entry.
    ///
    /// Fixed-width entries only accept payloads of their exact width.
    pub fn write(&mut self, index: u16, subindex: u8, data: Vec<u8>) -> Result<(), ErrorCode> {
        match self.entries.get_mut(&(index, subindex)) {
            None => Err(ErrorCode::ObjectWrite),
            Some(ObjectEntry::Dynamic(..)) | Some(ObjectEntry::Static { writable: false, .. }) => {
                Err(ErrorCode::ObjectAccess)
            }
            Some(ObjectEntry::Static { data: stored, payload_type, .. }) => {
                if let Some(width) = payload_type.width() {
                    if data.len() != width {
                        return Err(ErrorCode::ObjectRange);
                    }
                }
                *stored = data;
                Ok(())
            }
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log a summary of all objects
    pub fn log_summary(&self) {
        let mut indices: Vec<_> = self.entries.keys().collect();
        indices.sort();

        for (index, subindex) in indices {
            let entry_type = match &self.entries[&(*index, *subindex)] {
                ObjectEntry::Static { payload_type, writable: true, .. } => format!("Writable {:?}", payload_type),
                ObjectEntry::Static { payload_type, .. } => format!("Static {:?}", payload_type),
                ObjectEntry::Dynamic(_, payload_type) => format!("Dynamic {:?}", payload_type),
            };
            info!("  0x{:04X}:{:02X} - {}", index, subindex, entry_type);
        }
    }

    /// Add standard test objects for demonstration
    pub fn add_test_objects(&mut self) {
        // 0x1000:00 - Device Type (UInt32)
        self.add_static(0x1000, 0x00, 0x0000_0191u32.to_le_bytes().to_vec(), PayloadType::Uint32);

        // 0x1001:00 - Error Register (UInt8)
        self.add_static(0x1001, 0x00, vec![0x00], PayloadType::Uint8);

        // 0x1008:00 - Device Name (String)
        self.add_static(0x1008, 0x00, b"MockDsspNode".to_vec(), PayloadType::String);

        // 0x1017:00 - Producer Heartbeat Time in ms (UInt16)
        self.add_writable(0x1017, 0x00, 1000u16.to_le_bytes().to_vec(), PayloadType::Uint16);

        // 0x1018:01 - Vendor ID (UInt32)
        self.add_static(0x1018, 0x01, 0x0000_0001u32.to_le_bytes().to_vec(), PayloadType::Uint32);

        // 0x1F50:01 - Program Data, long enough to need segments
        let program: Vec<u8> = (0..100u8).collect();
        self.add_writable(0x1F50, 0x01, program, PayloadType::Domain);

        // 0x2000:01 - Temperature Sensor (Real32)
        self.add_dynamic(
            0x2000,
            0x01,
            || {
                let mut rng = rand::rng();
                let temp: f32 = rng.random_range(20.0..30.0);
                temp.to_le_bytes().to_vec()
            },
            PayloadType::Real32,
        );

        // 0x2001:01 - Counter (UInt32), incremented on every read
        let counter = Arc::new(AtomicU32::new(0));
        self.add_dynamic(
            0x2001,
            0x01,
            move || counter.fetch_add(1, Ordering::SeqCst).to_le_bytes().to_vec(),
            PayloadType::Uint32,
        );

        // 0x2003:01 - Control Word (UInt16)
        self.add_writable(0x2003, 0x01, 0x000Fu16.to_le_bytes().to_vec(), PayloadType::Uint16);

        // 0x2004:01 - RPM (Int32)
        self.add_dynamic(
            0x2004,
            0x01,
            || {
                let mut rng = rand::rng();
                let rpm: i32 = rng.random_range(1000..3000);
                rpm.to_le_bytes().to_vec()
            },
            PayloadType::Int32,
        );
    }
}

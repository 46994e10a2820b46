//! Candidate firmware images held by a distributor.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{DfuError, DfuResult};
use super::types::DfuImage;

/// Slot description, without the image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub index: usize,
    pub fwid: Vec<u8>,
    pub metadata: Vec<u8>,
    pub uri: String,
    pub size: u32,
    pub valid: bool,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub fwid: Vec<u8>,
    pub metadata: Vec<u8>,
    pub uri: String,
    pub size: u32,
    pub created_at: i64,
    data: Option<Bytes>,
}

impl Slot {
    /// A slot is valid once its image is committed.
    pub fn is_valid(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn image(&self) -> DfuImage {
        DfuImage {
            fwid: self.fwid.clone(),
            metadata: self.metadata.clone(),
            size: self.size,
        }
    }
}

/// Fixed-capacity slot store, indexed by slot number.
#[derive(Debug)]
pub struct SlotStore {
    slots: Vec<Option<Slot>>,
}

impl SlotStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot for an image. The slot is invalid until committed.
    pub fn add(&mut self, fwid: Vec<u8>, metadata: Vec<u8>, uri: String, size: u32) -> DfuResult<usize> {
        if let Some(index) = self.find_by_fwid(&fwid) {
            return Err(DfuError::SlotExists(index));
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(DfuError::SlotStoreFull(self.slots.len()))?;

        tracing::debug!(index, size, uri = %uri, "Slot reserved");
        self.slots[index] = Some(Slot {
            fwid,
            metadata,
            uri,
            size,
            created_at: chrono::Utc::now().timestamp(),
            data: None,
        });
        Ok(index)
    }

    /// Store the image bytes, making the slot valid.
    pub fn commit(&mut self, index: usize, data: Bytes) -> DfuResult<()> {
        let slot = self.get_mut(index)?;
        if data.len() != slot.size as usize {
            return Err(DfuError::SizeMismatch {
                expected: slot.size,
                actual: data.len(),
            });
        }
        slot.data = Some(data);
        tracing::info!(index, "Slot committed");
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> DfuResult<()> {
        self.get_mut(index)?;
        self.slots[index] = None;
        Ok(())
    }

    pub fn delete_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn find_by_fwid(&self, fwid: &[u8]) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.fwid == fwid))
    }

    /// Image descriptor and bytes of a valid slot.
    pub fn image(&self, index: usize) -> DfuResult<(DfuImage, Bytes)> {
        let slot = self.get(index).ok_or(DfuError::SlotNotFound(index))?;
        let data = slot.data().cloned().ok_or(DfuError::SlotInvalid(index))?;
        Ok((slot.image(), data))
    }

    pub fn list(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, s)| {
                s.as_ref().map(|s| SlotInfo {
                    index,
                    fwid: s.fwid.clone(),
                    metadata: s.metadata.clone(),
                    uri: s.uri.clone(),
                    size: s.size,
                    valid: s.is_valid(),
                    created_at: s.created_at,
                })
            })
            .collect()
    }

    fn get_mut(&mut self, index: usize) -> DfuResult<&mut Slot> {
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(DfuError::SlotNotFound(index))
    }
}

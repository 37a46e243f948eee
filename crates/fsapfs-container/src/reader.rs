//! Block level access to the shared container source

use crate::crypto::VolumeKey;
use crate::object::{verify_checksum, ObjectHeader};
use fsapfs_core::{checked_multiply_u64, validate_allocation_size, ByteSource, Error, Result, MAX_ALLOCATION_SIZE};
use std::sync::{Arc, Mutex};

/// Source shared by a container and every handle derived from it
///
/// Closing the container takes the source out of the slot; later reads
/// through any clone fail with [`Error::NotOpen`].
pub(crate) type SharedSource = Arc<Mutex<Option<Box<dyn ByteSource>>>>;

/// Reads blocks and objects from the container source
#[derive(Clone)]
pub(crate) struct BlockReader {
    source: SharedSource,
    block_size: u32,
    verify_checksums: bool,
}

impl BlockReader {
    pub fn new(source: SharedSource, block_size: u32, verify_checksums: bool) -> Self {
        Self {
            source,
            block_size,
            verify_checksums,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// True while the container source is attached
    pub fn is_open(&self) -> bool {
        self.source.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Detach and drop the source
    pub fn release(&self) -> Result<()> {
        let mut slot = self
            .source
            .lock()
            .map_err(|_| Error::corrupt("Container source lock poisoned"))?;
        match slot.take() {
            Some(_) => Ok(()),
            None => Err(Error::not_open("Container source already released")),
        }
    }

    /// Read `len` bytes at an absolute offset
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut slot = self
            .source
            .lock()
            .map_err(|_| Error::corrupt("Container source lock poisoned"))?;
        let source = slot
            .as_mut()
            .ok_or_else(|| Error::not_open("Container has been closed"))?;

        let mut buf = vec![0u8; len];
        source.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read `count` consecutive blocks starting at a physical address
    pub fn read_blocks(&self, paddr: u64, count: u64) -> Result<Vec<u8>> {
        let offset = checked_multiply_u64(paddr, self.block_size as u64, "Block offset")?;
        let size = checked_multiply_u64(count, self.block_size as u64, "Block run size")?;
        let size = validate_allocation_size(size, MAX_ALLOCATION_SIZE, "Block run")?;

        tracing::trace!("Reading {} block(s) at {}", count, paddr);
        self.read_at(offset, size)
    }

    /// Read one block
    pub fn read_block(&self, paddr: u64) -> Result<Vec<u8>> {
        self.read_blocks(paddr, 1)
    }

    /// Read a metadata object and check its type
    pub fn read_object(&self, paddr: u64, expected_kind: Option<u32>) -> Result<(ObjectHeader, Vec<u8>)> {
        let data = self.read_block(paddr)?;
        self.check_object(paddr, data, expected_kind)
    }

    /// Read a metadata object stored encrypted with a volume key
    pub fn read_encrypted_object(
        &self,
        paddr: u64,
        key: &VolumeKey,
        expected_kind: Option<u32>,
    ) -> Result<(ObjectHeader, Vec<u8>)> {
        let mut data = self.read_block(paddr)?;
        key.decrypt(&mut data, self.sector_of_block(paddr)?)?;
        self.check_object(paddr, data, expected_kind)
    }

    /// First 512-byte sector of a block, used as XTS tweak
    pub fn sector_of_block(&self, paddr: u64) -> Result<u64> {
        checked_multiply_u64(paddr, (self.block_size / 512) as u64, "Sector number")
    }

    pub fn check_object(
        &self,
        paddr: u64,
        data: Vec<u8>,
        expected_kind: Option<u32>,
    ) -> Result<(ObjectHeader, Vec<u8>)> {
        if self.verify_checksums {
            verify_checksum(&data)?;
        }

        let header = ObjectHeader::parse(&data)?;
        if let Some(kind) = expected_kind {
            if header.kind() != kind {
                return Err(Error::corrupt(format!(
                    "Object at block {} has type 0x{:04x}, expected 0x{:04x}",
                    paddr,
                    header.kind(),
                    kind
                )));
            }
        }
        Ok((header, data))
    }
}

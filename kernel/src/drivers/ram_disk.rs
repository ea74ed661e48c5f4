use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use alloc::vec;
use alloc::vec::Vec;

/// A block driver backed by kernel memory.
///
/// The swap device runs on one of these until real disk drivers land; the
/// block tests use them for everything.
pub struct RamDisk {
    sectors: Vec<u8>,
}

impl RamDisk {
    pub fn new(sector_count: BlockSector) -> Self {
        Self {
            sectors: vec![0; sector_count as usize * BLOCK_SECTOR_SIZE],
        }
    }

    /// Build a disk holding `data`, zero-padded up to a sector boundary.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut sectors = data.to_vec();
        let padded = data.len().next_multiple_of(BLOCK_SECTOR_SIZE);
        sectors.resize(padded, 0);
        Self { sectors }
    }

    fn range(&self, sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if sector >= self.capacity() {
            return Err(BlockError::SectorOutOfBounds);
        }
        buf.copy_from_slice(&self.sectors[self.range(sector)]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if sector >= self.capacity() {
            return Err(BlockError::SectorOutOfBounds);
        }
        let range = self.range(sector);
        self.sectors[range].copy_from_slice(buf);
        Ok(())
    }

    fn capacity(&self) -> BlockSector {
        (self.sectors.len() / BLOCK_SECTOR_SIZE) as BlockSector
    }
}

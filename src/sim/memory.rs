//! Flat memory made of disjoint mapped regions.

use super::SimError;

#[derive(Debug, Clone)]
struct Region {
    base: u32,
    bytes: Vec<u8>,
    writable: bool,
}

impl Region {
    fn end(&self) -> u64 {
        u64::from(self.base) + self.bytes.len() as u64
    }
}

/// Little-endian memory; accesses outside every region fail.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    regions: Vec<Region>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory holding a single region.
    pub fn with_region(base: u32, bytes: Vec<u8>, writable: bool) -> Self {
        Self {
            regions: vec![Region {
                base,
                bytes,
                writable,
            }],
        }
    }

    /// Map `bytes` at `base`.
    pub fn map(&mut self, base: u32, bytes: Vec<u8>, writable: bool) -> Result<(), SimError> {
        let end = u64::from(base) + bytes.len() as u64;
        if end > 1 << 32 {
            return Err(SimError::Overlap { base, len: bytes.len() });
        }
        let overlaps = self
            .regions
            .iter()
            .any(|r| u64::from(base) < r.end() && u64::from(r.base) < end);
        if overlaps {
            return Err(SimError::Overlap { base, len: bytes.len() });
        }
        self.regions.push(Region {
            base,
            bytes,
            writable,
        });
        Ok(())
    }

    pub fn map_f32s(&mut self, base: u32, values: &[f32], writable: bool) -> Result<(), SimError> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.map(base, bytes, writable)
    }

    fn locate(&self, address: u32, size: u32, access: &'static str) -> Result<(usize, usize), SimError> {
        if address % size != 0 {
            return Err(SimError::Unaligned { address, size });
        }
        let end = u64::from(address) + u64::from(size);
        self.regions
            .iter()
            .position(|r| u64::from(address) >= u64::from(r.base) && end <= r.end())
            .map(|index| (index, (address - self.regions[index].base) as usize))
            .ok_or(SimError::Unmapped {
                address,
                size,
                access,
            })
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, SimError> {
        let (region, offset) = self.locate(address, 4, "read")?;
        let bytes = &self.regions[region].bytes[offset..offset + 4];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), SimError> {
        let (region, offset) = self.locate(address, 4, "write")?;
        let region = &mut self.regions[region];
        if !region.writable {
            return Err(SimError::ReadOnly { address });
        }
        region.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_f32s(&self, address: u32, count: usize) -> Result<Vec<f32>, SimError> {
        (0..count as u32)
            .map(|i| self.read_u32(address + 4 * i).map(f32::from_bits))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let mut memory = Memory::new();
        memory.map(0x1000, vec![0; 16], true).unwrap();
        memory.write_u32(0x1004, 0xDEAD_BEEF).unwrap();
        assert_eq!(memory.read_u32(0x1004), Ok(0xDEAD_BEEF));
        assert_eq!(memory.read_u32(0x1000), Ok(0));
    }

    #[test]
    fn test_single_region_memory() {
        let mut memory = Memory::with_region(0x4000, vec![0; 8], true);
        memory.write_u32(0x4004, 7).unwrap();
        assert_eq!(memory.read_u32(0x4004), Ok(7));
        assert!(matches!(memory.read_u32(0x4008), Err(SimError::Unmapped { .. })));
        assert!(matches!(
            memory.map(0x4000, vec![0; 4], true),
            Err(SimError::Overlap { .. })
        ));
    }

    #[test]
    fn test_faults() {
        let mut memory = Memory::new();
        memory.map_f32s(0x2000, &[1.0, 2.0], false).unwrap();
        assert_eq!(memory.read_f32s(0x2000, 2), Ok(vec![1.0, 2.0]));
        assert!(matches!(memory.read_u32(0x2008), Err(SimError::Unmapped { .. })));
        assert!(matches!(memory.read_u32(0x2002), Err(SimError::Unaligned { .. })));
        assert!(matches!(
            memory.write_u32(0x2000, 0),
            Err(SimError::ReadOnly { address: 0x2000 })
        ));
        assert!(matches!(
            memory.map(0x2004, vec![0; 4], true),
            Err(SimError::Overlap { .. })
        ));
    }
}

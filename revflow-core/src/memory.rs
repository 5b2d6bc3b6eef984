//! Memory Image
//!
//! This module provides the byte-addressable view of a loaded binary that the
//! code-flow analyzer and the emulator share. An image is a set of
//! non-overlapping maps, each with its own permission bits, plus the image-wide
//! pointer size and endianness.
//!
//! # Address Translation
//! Every access walks the map list for the containing region and translates
//! the virtual address to an offset inside that map's byte buffer. Unmapped
//! reads return `None` rather than failing; `probe` never errors.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RevflowError};

bitflags! {
    /// Memory map permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Perm: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// Byte order of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Endian {
    Little = 0,
    Big = 1,
}

/// A single mapped region.
///
/// Maps are created at image-load time and immutable afterwards. Within one
/// image no two maps overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMap {
    pub base: u64,
    pub size: u64,
    pub perms: Perm,
    pub name: String,
}

impl MemoryMap {
    /// True when `[va, va + len)` lies entirely inside this map.
    #[inline]
    pub fn contains(&self, va: u64, len: u64) -> bool {
        va >= self.base && va.wrapping_add(len) <= self.base + self.size
    }
}

/// Byte-addressable memory image with permissioned maps.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    maps: Vec<(MemoryMap, Vec<u8>)>,
    pointer_size: usize,
    endian: Endian,
}

impl MemoryImage {
    /// Create an empty image with the given pointer size (4 or 8) and byte
    /// order.
    pub fn new(pointer_size: usize, endian: Endian) -> Self {
        debug_assert!(pointer_size == 4 || pointer_size == 8);
        Self {
            maps: Vec::new(),
            pointer_size,
            endian,
        }
    }

    /// Pointer size of the image in bytes.
    #[inline]
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    /// Byte order of the image.
    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Add a map backed by `bytes` (zero-padded or truncated to `size`).
    ///
    /// # Errors
    /// Returns `MapOverlap` if the new region intersects an existing map.
    pub fn add_map(&mut self, base: u64, size: u64, perms: Perm, name: &str, bytes: Vec<u8>) -> Result<()> {
        for (map, _) in self.maps.iter() {
            if base < map.base + map.size && map.base < base + size {
                return Err(RevflowError::MapOverlap { base });
            }
        }

        let mut backing = bytes;
        backing.resize(size as usize, 0u8);

        self.maps.push((
            MemoryMap {
                base,
                size,
                perms,
                name: name.to_string(),
            },
            backing,
        ));
        Ok(())
    }

    /// Return the map containing `va`, if any.
    pub fn map_at(&self, va: u64) -> Option<&MemoryMap> {
        self.maps
            .iter()
            .map(|(map, _)| map)
            .find(|map| map.contains(va, 1))
    }

    /// All maps in the image, in insertion order.
    pub fn maps(&self) -> impl Iterator<Item = &MemoryMap> {
        self.maps.iter().map(|(map, _)| map)
    }

    /// Check that `[va, va + size)` is mapped with all bits of `perm`.
    /// Probing never errors.
    pub fn probe(&self, va: u64, size: usize, perm: Perm) -> bool {
        self.maps
            .iter()
            .any(|(map, _)| map.contains(va, size as u64) && map.perms.contains(perm))
    }

    /// Read `size` bytes at `va`, or `None` when the range is unmapped.
    pub fn read_bytes(&self, va: u64, size: usize) -> Option<&[u8]> {
        for (map, backing) in self.maps.iter() {
            if map.contains(va, size as u64) {
                let off = (va - map.base) as usize;
                return Some(&backing[off..off + size]);
            }
        }
        None
    }

    /// Write bytes at `va`.
    ///
    /// # Errors
    /// `UnmappedMemory` when the range is not mapped, `AccessViolation` when
    /// the containing map is not writable.
    pub fn write_bytes(&mut self, va: u64, bytes: &[u8]) -> Result<()> {
        for (map, backing) in self.maps.iter_mut() {
            if map.contains(va, bytes.len() as u64) {
                if !map.perms.contains(Perm::WRITE) {
                    return Err(RevflowError::AccessViolation { va });
                }
                let off = (va - map.base) as usize;
                backing[off..off + bytes.len()].copy_from_slice(bytes);
                return Ok(());
            }
        }
        Err(RevflowError::UnmappedMemory { va, size: bytes.len() })
    }

    /// Read an unsigned integer of `size` bytes (1, 2, 4 or 8) honoring the
    /// image byte order. `None` when unmapped.
    pub fn read_uint(&self, va: u64, size: usize) -> Option<u64> {
        let bytes = self.read_bytes(va, size)?;
        let mut val: u64 = 0;
        match self.endian {
            Endian::Little => {
                for (i, b) in bytes.iter().enumerate() {
                    val |= (*b as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for b in bytes.iter() {
                    val = (val << 8) | *b as u64;
                }
            }
        }
        Some(val)
    }

    /// Read a sign-extended integer of `size` bytes. `None` when unmapped.
    pub fn read_int(&self, va: u64, size: usize) -> Option<i64> {
        let val = self.read_uint(va, size)?;
        let shift = 64 - 8 * size as u32;
        Some(((val << shift) as i64) >> shift)
    }

    pub fn read_u8(&self, va: u64) -> Option<u8> {
        self.read_uint(va, 1).map(|v| v as u8)
    }

    pub fn read_u16(&self, va: u64) -> Option<u16> {
        self.read_uint(va, 2).map(|v| v as u16)
    }

    pub fn read_u32(&self, va: u64) -> Option<u32> {
        self.read_uint(va, 4).map(|v| v as u32)
    }

    pub fn read_u64(&self, va: u64) -> Option<u64> {
        self.read_uint(va, 8)
    }

    pub fn read_i8(&self, va: u64) -> Option<i8> {
        self.read_int(va, 1).map(|v| v as i8)
    }

    pub fn read_i16(&self, va: u64) -> Option<i16> {
        self.read_int(va, 2).map(|v| v as i16)
    }

    pub fn read_i32(&self, va: u64) -> Option<i32> {
        self.read_int(va, 4).map(|v| v as i32)
    }

    /// Read a pointer-sized unsigned value. `None` when unmapped.
    pub fn read_pointer(&self, va: u64) -> Option<u64> {
        self.read_uint(va, self.pointer_size)
    }

    /// Write an unsigned integer of `size` bytes honoring the image byte
    /// order.
    pub fn write_uint(&mut self, va: u64, value: u64, size: usize) -> Result<()> {
        let mut bytes = [0u8; 8];
        match self.endian {
            Endian::Little => {
                for (i, b) in bytes[..size].iter_mut().enumerate() {
                    *b = (value >> (8 * i)) as u8;
                }
            }
            Endian::Big => {
                for (i, b) in bytes[..size].iter_mut().enumerate() {
                    *b = (value >> (8 * (size - 1 - i))) as u8;
                }
            }
        }
        self.write_bytes(va, &bytes[..size])
    }

    /// True when `va` falls inside any map (used to terminate branch-table
    /// pointer walks).
    pub fn is_valid_pointer(&self, va: u64) -> bool {
        self.map_at(va).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> MemoryImage {
        let mut img = MemoryImage::new(4, Endian::Little);
        img.add_map(0x1000, 0x100, Perm::READ | Perm::EXEC, "text", vec![0xAA; 0x100])
            .unwrap();
        img.add_map(0x2000, 0x100, Perm::READ | Perm::WRITE, "data", vec![])
            .unwrap();
        img
    }

    #[test]
    fn overlapping_maps_rejected() {
        let mut img = image();
        let err = img
            .add_map(0x10F0, 0x40, Perm::READ, "overlap", vec![])
            .unwrap_err();
        assert_eq!(err, RevflowError::MapOverlap { base: 0x10F0 });
    }

    #[test]
    fn unmapped_reads_return_none() {
        let img = image();
        assert_eq!(img.read_bytes(0x3000, 4), None);
        assert_eq!(img.read_u32(0x10FE), None); // straddles the end of text
        assert!(!img.probe(0x3000, 1, Perm::READ));
    }

    #[test]
    fn probe_checks_permissions() {
        let img = image();
        assert!(img.probe(0x1000, 4, Perm::EXEC));
        assert!(!img.probe(0x1000, 4, Perm::WRITE));
        assert!(img.probe(0x2000, 4, Perm::WRITE));
        assert!(!img.probe(0x2000, 4, Perm::EXEC));
    }

    #[test]
    fn endian_round_trip() {
        let mut img = image();
        img.write_uint(0x2000, 0x11223344, 4).unwrap();
        assert_eq!(img.read_u32(0x2000), Some(0x11223344));
        assert_eq!(img.read_u8(0x2000), Some(0x44));

        let mut big = MemoryImage::new(4, Endian::Big);
        big.add_map(0x0, 0x10, Perm::READ | Perm::WRITE, "be", vec![]).unwrap();
        big.write_uint(0x0, 0x11223344, 4).unwrap();
        assert_eq!(big.read_u8(0x0), Some(0x11));
        assert_eq!(big.read_u32(0x0), Some(0x11223344));
    }

    #[test]
    fn signed_reads_sign_extend() {
        let mut img = image();
        img.write_uint(0x2000, 0xFF, 1).unwrap();
        assert_eq!(img.read_i8(0x2000), Some(-1));
        assert_eq!(img.read_int(0x2000, 1), Some(-1));
    }

    #[test]
    fn write_respects_permissions() {
        let mut img = image();
        let err = img.write_bytes(0x1000, &[0u8; 4]).unwrap_err();
        assert_eq!(err, RevflowError::AccessViolation { va: 0x1000 });
    }

    #[test]
    fn pointer_reads_use_image_psize() {
        let mut img = image();
        img.write_uint(0x2000, 0xDEAD1234, 4).unwrap();
        assert_eq!(img.read_pointer(0x2000), Some(0xDEAD1234));
    }
}

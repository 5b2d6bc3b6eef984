//! Executable Image Loading
//!
//! Builds a [`MemoryImage`] from an ELF executable: one map per PT_LOAD
//! segment, permissions translated from the segment flags, BSS tails
//! zero-filled. Pointer size and byte order come from the ELF header.

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;

use crate::error::{Result, RevflowError};
use crate::memory::{Endian, MemoryImage, Perm};

/// Map an ELF executable into a fresh memory image.
///
/// # Errors
/// `ImageParse` when the bytes are not a well-formed ELF or a segment's file
/// range lies outside the buffer; `MapOverlap` when segments collide.
pub fn load_elf(bytes: &[u8]) -> Result<MemoryImage> {
    let elf = Elf::parse(bytes).map_err(|err| RevflowError::ImageParse(err.to_string()))?;

    let pointer_size = if elf.is_64 { 8 } else { 4 };
    let endian = if elf.little_endian { Endian::Little } else { Endian::Big };
    let mut image = MemoryImage::new(pointer_size, endian);

    for (idx, phdr) in elf.program_headers.iter().enumerate() {
        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }

        let mut perms = Perm::empty();
        if phdr.p_flags & PF_R != 0 {
            perms |= Perm::READ;
        }
        if phdr.p_flags & PF_W != 0 {
            perms |= Perm::WRITE;
        }
        if phdr.p_flags & PF_X != 0 {
            perms |= Perm::EXEC;
        }

        let start = phdr.p_offset as usize;
        let end = start + phdr.p_filesz as usize;
        let data = bytes
            .get(start..end)
            .ok_or_else(|| {
                RevflowError::ImageParse(format!("segment {} data outside the file", idx))
            })?
            .to_vec();

        log::debug!(
            "load segment {}: 0x{:08x} ({} bytes, {:?})",
            idx,
            phdr.p_vaddr,
            phdr.p_memsz,
            perms
        );
        image.add_map(phdr.p_vaddr, phdr.p_memsz, perms, &format!("load{}", idx), data)?;
    }

    Ok(image)
}

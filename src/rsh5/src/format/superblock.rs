use super::*;

/// # [II.A.1] The Superblock
///
/// The superblock may begin at byte offset 0, 512, 1024, 2048, and
/// successive powers of two of the file; the first occurrence of the format
/// signature anchors it.
///
/// [II.A.1]: https://support.hdfgroup.org/documentation/hdf5/latest/_f_m_t3.html
///
/// Versions 0 and 1 lay out as follows (version 1 inserts the two
/// indexed-storage fields):
///
/// | Size          | Field |
/// | ------------- | ----- |
/// | 8             | Format signature `89 48 44 46 0d 0a 1a 0a` |
/// | 1             | Superblock version (0 or 1) |
/// | 1             | Free-space storage version |
/// | 1             | Root group symbol-table-entry version |
/// | 1             | Reserved |
/// | 1             | Shared-header-message format version |
/// | 1             | Size of offsets |
/// | 1             | Size of lengths |
/// | 1             | Reserved |
/// | 2             | Group leaf node K |
/// | 2             | Group internal node K |
/// | 4             | File consistency flags |
/// | 2             | Indexed storage internal node K (version 1 only) |
/// | 2             | Reserved (version 1 only) |
/// | offset-size   | Base address |
/// | offset-size   | Free-space info address |
/// | offset-size   | End-of-file address |
/// | offset-size   | Driver information block address |
/// | -             | Root group symbol table entry |
///
/// Versions 2 and 3 drop the B-tree K values and point at the root group's
/// object header directly:
///
/// | Size          | Field |
/// | ------------- | ----- |
/// | 8             | Format signature |
/// | 1             | Superblock version (2 or 3) |
/// | 1             | Size of offsets |
/// | 1             | Size of lengths |
/// | 1             | File consistency flags |
/// | offset-size   | Base address |
/// | offset-size   | Superblock extension address |
/// | offset-size   | End-of-file address |
/// | offset-size   | Root group object header address |
/// | 4             | Superblock checksum (Jenkins lookup3) |
pub struct Superblock {
    pub version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_k: u16,
    pub group_internal_k: u16,
    pub indexed_storage_k: u16,
    pub file_consistency_flags: u32,
    pub base_address: u64,
    pub free_space_address: Option<u64>,
    pub end_of_file_address: u64,
    pub driver_info_address: Option<u64>,
    pub extension_address: Option<u64>,
    pub root: RootPointer,
    /// File offset the signature was found at; all other addresses are
    /// relative to `base_address`, which is usually equal to it.
    pub signature_offset: u64,
}

/// Versions 0/1 anchor the root group with a cached symbol table entry;
/// versions 2/3 store the root object header address directly.
pub enum RootPointer {
    SymbolTable(SymbolTableEntry),
    ObjectHeader(u64),
}

pub const SIGNATURE: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0d, 0x0a, 0x1a, 0x0a];

/// Highest byte offset probed for the signature.
const MAX_SIGNATURE_OFFSET: u64 = 64 * 1024;

/// Address-width parameters threaded through every subsequent decoder.
/// Fixed for the lifetime of the open file.
#[derive(Debug, Clone, Copy)]
pub struct FormatContext {
    pub offset_size: u8,
    pub length_size: u8,
}

impl FormatContext {
    pub fn offset_spec(&self) -> FixedPointSpec {
        FixedPointSpec::address(self.offset_size)
    }

    pub fn length_spec(&self) -> FixedPointSpec {
        FixedPointSpec::address(self.length_size)
    }
}

impl Superblock {
    pub fn read(channel: &Channel) -> Result<Superblock> {
        let signature_offset = Self::locate_signature(channel)?;

        // Generous upper bound: the largest legal superblock (version 1,
        // 8-byte offsets, 40-byte root entry) is well under 256 bytes.
        let mut block = channel.read_block_at_most(signature_offset, 256)?;
        block.skip_bytes(SIGNATURE.len())?;

        let version = block.read_u8()?;
        debug!("superblock version {version} at offset {signature_offset}");
        match version {
            0 | 1 => Self::read_v0_v1(&mut block, version, signature_offset),
            2 | 3 => Self::read_v2_v3(&mut block, version, signature_offset),
            _ => Err(HdfError::InvalidSuperblock(format!(
                "unknown superblock version {version}"
            ))),
        }
    }

    fn locate_signature(channel: &Channel) -> Result<u64> {
        let mut offset = 0u64;
        loop {
            let mut candidate = [0u8; 8];
            if channel.read_exact_at(offset, &mut candidate).is_ok() && candidate == SIGNATURE {
                return Ok(offset);
            }
            offset = if offset == 0 { 512 } else { offset * 2 };
            if offset > MAX_SIGNATURE_OFFSET {
                return Err(HdfError::InvalidSuperblock(
                    "format signature not found".into(),
                ));
            }
        }
    }

    fn read_v0_v1(block: &mut Block, version: u8, signature_offset: u64) -> Result<Superblock> {
        let free_space_version = block.read_u8()?;
        let root_entry_version = block.read_u8()?;
        block.skip_bytes(1)?;
        let shared_header_version = block.read_u8()?;
        if free_space_version != 0 || root_entry_version != 0 || shared_header_version != 0 {
            return Err(HdfError::InvalidSuperblock(
                "unexpected sub-component version in superblock".into(),
            ));
        }

        let offset_size = block.read_u8()?;
        let length_size = block.read_u8()?;
        Self::check_word_size("size of offsets", offset_size)?;
        Self::check_word_size("size of lengths", length_size)?;
        block.skip_bytes(1)?;

        let group_leaf_k = block.read_u16::<LittleEndian>()?;
        let group_internal_k = block.read_u16::<LittleEndian>()?;
        let file_consistency_flags = block.read_u32::<LittleEndian>()?;

        let indexed_storage_k = if version == 1 {
            let k = block.read_u16::<LittleEndian>()?;
            block.skip_bytes(2)?;
            k
        } else {
            0
        };

        let base_address = block.read_offset(offset_size)?.ok_or_else(|| {
            HdfError::InvalidSuperblock("base address is undefined".into())
        })?;
        let free_space_address = block.read_offset(offset_size)?;
        let end_of_file_address = block.read_offset(offset_size)?.ok_or_else(|| {
            HdfError::InvalidSuperblock("end-of-file address is undefined".into())
        })?;
        let driver_info_address = block.read_offset(offset_size)?;

        let ctx = FormatContext {
            offset_size,
            length_size,
        };
        let root_entry = SymbolTableEntry::read(block, &ctx)?;

        Ok(Superblock {
            version,
            offset_size,
            length_size,
            group_leaf_k,
            group_internal_k,
            indexed_storage_k,
            file_consistency_flags,
            base_address,
            free_space_address,
            end_of_file_address,
            driver_info_address,
            extension_address: None,
            root: RootPointer::SymbolTable(root_entry),
            signature_offset,
        })
    }

    fn read_v2_v3(block: &mut Block, version: u8, signature_offset: u64) -> Result<Superblock> {
        let offset_size = block.read_u8()?;
        let length_size = block.read_u8()?;
        Self::check_word_size("size of offsets", offset_size)?;
        Self::check_word_size("size of lengths", length_size)?;
        let file_consistency_flags = block.read_u8()? as u32;

        let base_address = block.read_offset(offset_size)?.ok_or_else(|| {
            HdfError::InvalidSuperblock("base address is undefined".into())
        })?;
        let extension_address = block.read_offset(offset_size)?;
        let end_of_file_address = block.read_offset(offset_size)?.ok_or_else(|| {
            HdfError::InvalidSuperblock("end-of-file address is undefined".into())
        })?;
        let root_header_address = block.read_offset(offset_size)?.ok_or_else(|| {
            HdfError::InvalidSuperblock("root group address is undefined".into())
        })?;

        let stored_checksum = block.read_u32::<LittleEndian>()?;
        let end = block.position() as usize - 4;
        let computed = checksum::lookup3(&block.get_ref()[..end]);
        if stored_checksum != computed {
            return Err(HdfError::InvalidSuperblock(format!(
                "superblock checksum mismatch: stored {stored_checksum:#010x}, computed {computed:#010x}"
            )));
        }

        Ok(Superblock {
            version,
            offset_size,
            length_size,
            group_leaf_k: 0,
            group_internal_k: 0,
            indexed_storage_k: 0,
            file_consistency_flags,
            base_address,
            free_space_address: None,
            end_of_file_address,
            driver_info_address: None,
            extension_address,
            root: RootPointer::ObjectHeader(root_header_address),
            signature_offset,
        })
    }

    fn check_word_size(what: &str, size: u8) -> Result<()> {
        if !matches!(size, 2 | 4 | 8) {
            return Err(HdfError::InvalidSuperblock(format!(
                "{what} is {size}, expected 2, 4 or 8"
            )));
        }
        Ok(())
    }

    pub fn context(&self) -> FormatContext {
        FormatContext {
            offset_size: self.offset_size,
            length_size: self.length_size,
        }
    }

    /// Object header address of the root group.
    pub fn root_header_address(&self) -> u64 {
        match &self.root {
            RootPointer::SymbolTable(entry) => entry.object_header_address,
            RootPointer::ObjectHeader(address) => *address,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v0_image() -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(&SIGNATURE);
        image.extend_from_slice(&[0, 0, 0, 0, 0]); // version, fs, root entry, reserved, shared
        image.push(8); // offset size
        image.push(8); // length size
        image.push(0);
        image.extend_from_slice(&4u16.to_le_bytes());
        image.extend_from_slice(&16u16.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u64.to_le_bytes()); // base
        image.extend_from_slice(&[0xff; 8]); // free space: undefined
        image.extend_from_slice(&2048u64.to_le_bytes()); // eof
        image.extend_from_slice(&[0xff; 8]); // driver info: undefined
        // root symbol table entry: link name 0, header at 0x60, no cache
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&0x60u64.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&[0u8; 16]);
        image
    }

    #[test]
    fn v0_roundtrip() {
        let channel = Channel::from_bytes(v0_image());
        let superblock = Superblock::read(&channel).unwrap();
        assert_eq!(superblock.version, 0);
        assert_eq!(superblock.offset_size, 8);
        assert_eq!(superblock.group_leaf_k, 4);
        assert_eq!(superblock.free_space_address, None);
        assert_eq!(superblock.driver_info_address, None);
        assert_eq!(superblock.end_of_file_address, 2048);
        assert_eq!(superblock.root_header_address(), 0x60);
    }

    #[test]
    fn signature_found_at_512() {
        let mut image = vec![0u8; 512];
        image.extend_from_slice(&v0_image());
        let channel = Channel::from_bytes(image);
        let superblock = Superblock::read(&channel).unwrap();
        assert_eq!(superblock.signature_offset, 512);
    }

    #[test]
    fn missing_signature() {
        let channel = Channel::from_bytes(vec![0u8; 4096]);
        assert!(matches!(
            Superblock::read(&channel),
            Err(HdfError::InvalidSuperblock(_))
        ));
    }
}

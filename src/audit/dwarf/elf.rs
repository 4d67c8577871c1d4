use crate::audit::error::Error;
use bytes::Bytes;
use object::{Object, ObjectSection};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const EHDR_SIZE: usize = 64;
const SHDR_SIZE: u16 = 64;

/// The embedded ELF object carrying the runtime's debug information.
///
/// Validation is strict about the fields the analyzer relies on (64-bit
/// class, little-endian data, a section name table); everything else,
/// including sections the loader has no use for, is tolerated.
pub struct ElfImage<'a> {
    file: object::File<'a>,
}

impl<'a> ElfImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < EHDR_SIZE || &data[0..4] != ELF_MAGIC {
            return Err(Error::NotElf);
        }
        if data[4] != 2 {
            return Err(Error::UnsupportedAbi("not a 64-bit ELF class"));
        }
        if data[5] != 1 {
            return Err(Error::UnsupportedAbi("not little-endian"));
        }

        let shoff = read_u64(data, 0x28);
        let shentsize = read_u16(data, 0x3a);
        let shstrndx = read_u16(data, 0x3e);
        if shoff == 0 || shstrndx == 0 {
            return Err(Error::MissingSectionNameTable);
        }
        if shentsize != SHDR_SIZE {
            return Err(Error::UnsupportedAbi("unexpected section header size"));
        }

        let file = object::File::parse(data)?;
        Ok(Self { file })
    }

    /// Named sections in section-table order. The initial null section has
    /// an empty name and is skipped.
    pub fn named_sections(&self) -> Result<Vec<(String, Bytes)>, Error> {
        let mut sections = vec![];
        for section in self.file.sections() {
            let name = section.name()?;
            if name.is_empty() {
                continue;
            }
            let data = section.uncompressed_data()?;
            sections.push((name.to_string(), Bytes::copy_from_slice(&data)));
        }
        Ok(sections)
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(
        data[offset..offset + 2]
            .try_into()
            .expect("header length checked"),
    )
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(
        data[offset..offset + 8]
            .try_into()
            .expect("header length checked"),
    )
}

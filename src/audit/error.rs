use gimli::DwTag;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- record stream errors --------------------------------------
    #[error("unsupported msgpack tag 0x{tag:02x} at offset {offset}")]
    UnsupportedTag { tag: u8, offset: usize },
    #[error("msgpack value truncated at offset {offset}")]
    Truncated { offset: usize },
    #[error("malformed audit record: {0}")]
    MalformedRecord(&'static str),
    #[error("value {0} does not round-trip through {1}")]
    Narrow(u64, &'static str),

    // --------------------------------- elf errors ------------------------------------------------
    #[error("not an ELF image")]
    NotElf,
    #[error("unsupported ELF: {0}")]
    UnsupportedAbi(&'static str),
    #[error("ELF section name table missing")]
    MissingSectionNameTable,
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- dwarf errors ----------------------------------------------
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("debug information entry `{0}` not found")]
    DieNotFound(String),
    #[error("unsupported debug information entry tag: {0}")]
    UnsupportedDie(DwTag),
    #[error("attribute `{attr}` missing on `{die}`")]
    MissingAttribute { die: String, attr: &'static str },

    // --------------------------------- model errors ----------------------------------------------
    #[error("memory image at address 0x{0:x} not found")]
    MissingMemory(u64),
    #[error("field `{0}` not found in `{1}`")]
    MissingField(String, String),
    #[error("memory image at 0x{0:x} shorter than its descriptor")]
    ShortImage(u64),

    // --------------------------------- vm profile errors -----------------------------------------
    #[error("bad profile magic 0x{0:08x}")]
    ProfileMagic(u32),
    #[error("unsupported profile version {0}.{1}")]
    ProfileVersion(u16, u16),
    #[error("profile truncated: expect {expected} bytes, got {actual}")]
    ProfileTruncated { expected: usize, actual: usize },
    #[error("profile shapes differ: {0}x{1} vs {2}x{3}")]
    ProfileShape(usize, usize, usize, usize),
    #[error("profile snapshot for `{0}` is older than the previous one")]
    ProfileOrder(String),
}

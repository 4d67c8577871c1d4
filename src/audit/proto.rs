use crate::audit::error::Error;
use crate::audit::memory::View;
use bytes::Bytes;

/// A function prototype, reconstructed from its raw memory image.
///
/// The runtime allocates a prototype and its auxiliary arrays in one block:
/// the bytecode array sits immediately behind the header, and the
/// `lineinfo`/`declname` pointers point back into the same allocation. The
/// captured image covers the whole block, so those pointers are re-homed by
/// their delta from the original allocation address.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub address: u64,
    pub chunkname: String,
    pub declname: String,
    pub firstline: u32,
    pub sizebc: u32,
    bc: Bytes,
    lineinfo: Vec<u32>,
}

impl Prototype {
    pub(super) fn reconstruct(
        view: View<'_>,
        data: &Bytes,
        chunkname: String,
    ) -> Result<Self, Error> {
        let address = view.address;
        let header_size = view.byte_size() as usize;
        let firstline = view.field_u64("firstline")? as u32;
        let sizebc = view.field_u64("sizebc")? as u32;
        let declname_ptr = view.field_u64("declname")?;
        let lineinfo_ptr = view.field_u64("lineinfo")?;

        let bc_end = header_size + sizebc as usize * 4;
        if data.len() < bc_end {
            return Err(Error::ShortImage(address));
        }
        let bc = data.slice(header_size..bc_end);

        let lineinfo = if lineinfo_ptr == 0 {
            vec![]
        } else {
            let start = colocated(address, lineinfo_ptr, data.len())?;
            let end = start + sizebc as usize * 4;
            let raw = data.get(start..end).ok_or(Error::ShortImage(address))?;
            raw.chunks_exact(4)
                .map(|w| u32::from_le_bytes(w.try_into().expect("chunked")))
                .collect()
        };

        let declname = if declname_ptr == 0 {
            "?".to_string()
        } else {
            let start = colocated(address, declname_ptr, data.len())?;
            let raw = &data[start..];
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        };

        Ok(Self {
            address,
            chunkname,
            declname,
            firstline,
            sizebc,
            bc,
            lineinfo,
        })
    }

    /// Raw bytecode word at position `pos`.
    pub fn bc(&self, pos: u32) -> Option<u32> {
        let start = pos as usize * 4;
        self.bc
            .get(start..start + 4)
            .map(|w| u32::from_le_bytes(w.try_into().expect("sized")))
    }

    /// Source line of the bytecode at `pos`.
    pub fn line(&self, pos: u32) -> u32 {
        self.firstline + self.lineinfo.get(pos as usize).copied().unwrap_or(0)
    }
}

/// Re-home a pointer from the original process into the captured image.
fn colocated(base: u64, ptr: u64, len: usize) -> Result<usize, Error> {
    let offset = ptr
        .checked_sub(base)
        .filter(|off| (*off as usize) < len)
        .ok_or(Error::ShortImage(base))?;
    Ok(offset as usize)
}

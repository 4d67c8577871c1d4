use crate::audit::dwarf::descriptor::{Descriptor, TypeGraph, TypeId};
use crate::audit::error::Error;
use bytes::Bytes;
use std::collections::HashMap;

/// One raw memory image captured by the runtime, together with the
/// descriptor reconstructed from its record's hint. The descriptor is
/// always a pointer type: dereferencing it yields a view over the bytes.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    pub address: u64,
    pub hint: String,
    pub type_id: TypeId,
    pub data: Bytes,
}

/// Process-space address to typed image. Keys are the numeric 64-bit
/// address value, never the encoding the record used.
#[derive(Debug, Default)]
pub struct MemoryMap {
    images: HashMap<u64, MemoryImage>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: MemoryImage) {
        self.images.insert(image.address, image);
    }

    #[inline(always)]
    pub fn get(&self, address: u64) -> Option<&MemoryImage> {
        self.images.get(&address)
    }

    #[inline(always)]
    pub fn contains(&self, address: u64) -> bool {
        self.images.contains_key(&address)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Dereferenced view over the image at `address`: the image's pointer
    /// descriptor is unwrapped to its pointee.
    pub fn view<'a>(&'a self, graph: &'a TypeGraph, address: u64) -> Result<View<'a>, Error> {
        let image = self.get(address).ok_or(Error::MissingMemory(address))?;
        let type_id = match graph.get(image.type_id) {
            Descriptor::Pointer { target: Some(t) } => *t,
            _ => image.type_id,
        };
        Ok(View {
            graph,
            address: image.address,
            type_id,
            data: &image.data,
        })
    }
}

/// A typed, read-only window into a memory image. Field access is plain
/// little-endian offset arithmetic against the synthesized layout.
#[derive(Clone, Copy)]
pub struct View<'a> {
    graph: &'a TypeGraph,
    pub address: u64,
    pub type_id: TypeId,
    data: &'a [u8],
}

impl<'a> View<'a> {
    pub fn new(graph: &'a TypeGraph, address: u64, type_id: TypeId, data: &'a [u8]) -> Self {
        Self {
            graph,
            address,
            type_id,
            data,
        }
    }

    #[inline(always)]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    #[inline(always)]
    pub fn descriptor(&self) -> &'a Descriptor {
        self.graph.get(self.type_id)
    }

    /// Declared byte size of the viewed type.
    #[inline(always)]
    pub fn byte_size(&self) -> u64 {
        self.graph.size_of(self.type_id)
    }

    /// Narrow the view to a named member of a structure or union.
    pub fn field(&self, name: &str) -> Result<View<'a>, Error> {
        let fields = match self.descriptor() {
            Descriptor::Struct { fields, .. } | Descriptor::Union { fields, .. } => fields,
            _ => {
                return Err(Error::MissingField(
                    name.to_string(),
                    self.graph.type_name(self.type_id),
                ))
            }
        };
        let field = fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .ok_or_else(|| {
                Error::MissingField(name.to_string(), self.graph.type_name(self.type_id))
            })?;

        let start = field.offset as usize;
        let size = self.graph.size_of(field.type_id) as usize;
        let data = self
            .data
            .get(start..start + size)
            .ok_or(Error::ShortImage(self.address))?;
        Ok(View {
            graph: self.graph,
            address: self.address + field.offset,
            type_id: field.type_id,
            data,
        })
    }

    /// Read this view as an unsigned little-endian scalar. Wrapper records
    /// holding a single member (the runtime's tagged reference types) are
    /// drilled through transparently.
    pub fn scalar(&self) -> Result<u64, Error> {
        let mut view = *self;
        loop {
            match view.descriptor() {
                Descriptor::Struct { fields, .. } | Descriptor::Union { fields, .. } => {
                    let mut named = fields.iter().filter(|f| f.name.is_some());
                    match (named.next(), named.next()) {
                        (Some(only), None) => view = view.field_at(only.offset, only.type_id)?,
                        _ => return view.raw_scalar(),
                    }
                }
                _ => return view.raw_scalar(),
            }
        }
    }

    /// Read this view as a signed scalar, sign-extending when the base type
    /// is signed.
    pub fn scalar_i64(&self) -> Result<i64, Error> {
        let raw = self.scalar()?;
        let size = self.graph.size_of(self.type_id);
        if self.graph.is_signed(self.type_id) && size < 8 {
            let shift = 64 - size * 8;
            Ok(((raw << shift) as i64) >> shift)
        } else {
            Ok(raw as i64)
        }
    }

    /// Shorthand for `field(name)?.scalar()`.
    #[inline(always)]
    pub fn field_u64(&self, name: &str) -> Result<u64, Error> {
        self.field(name)?.scalar()
    }

    #[inline(always)]
    pub fn field_i64(&self, name: &str) -> Result<i64, Error> {
        self.field(name)?.scalar_i64()
    }

    fn field_at(&self, offset: u64, type_id: TypeId) -> Result<View<'a>, Error> {
        let start = offset as usize;
        let size = self.graph.size_of(type_id) as usize;
        let data = self
            .data
            .get(start..start + size)
            .ok_or(Error::ShortImage(self.address))?;
        Ok(View {
            graph: self.graph,
            address: self.address + offset,
            type_id,
            data,
        })
    }

    fn raw_scalar(&self) -> Result<u64, Error> {
        let size = (self.graph.size_of(self.type_id) as usize).min(self.data.len());
        match size {
            1 => Ok(self.data[0] as u64),
            2 => Ok(u16::from_le_bytes(self.data[..2].try_into().expect("sized")) as u64),
            4 => Ok(u32::from_le_bytes(self.data[..4].try_into().expect("sized")) as u64),
            8 => Ok(u64::from_le_bytes(self.data[..8].try_into().expect("sized"))),
            _ => Err(Error::ShortImage(self.address)),
        }
    }
}

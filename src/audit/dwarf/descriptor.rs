use crate::audit::dwarf::{const_value, die_name, type_ref, udata_attr, DieOffset, EndianArcSlice};
use crate::audit::error::Error;
use gimli::{DW_AT_byte_size, DW_AT_data_member_location, DW_AT_encoding, AttributeValue, DwTag};
use std::collections::HashMap;

/// Descriptor identifier, an index into the [`TypeGraph`] arena.
pub type TypeId = usize;

#[derive(Debug, Clone)]
pub struct Field {
    pub offset: u64,
    /// `None` marks explicit padding.
    pub name: Option<String>,
    pub type_id: TypeId,
}

/// The synthesized layout description of a type. Descriptors reference each
/// other through arena ids, so cyclic type graphs (a structure pointing at
/// itself) are representable without reference cycles.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Base {
        name: String,
        size: u64,
        signed: bool,
    },
    Pointer {
        /// `None` is an opaque pointer.
        target: Option<TypeId>,
    },
    Struct {
        name: Option<String>,
        size: u64,
        fields: Vec<Field>,
    },
    Union {
        name: Option<String>,
        size: u64,
        fields: Vec<Field>,
    },
    Enum {
        name: Option<String>,
        size: u64,
        enumerators: HashMap<i64, String>,
    },
    /// A size-only placeholder: installed for a structure before its members
    /// are walked (this is what terminates cyclic type graphs), and used as
    /// the descriptor of padding fields.
    Opaque { size: u64 },
}

/// Arena of synthesized descriptors, keyed by the DIE they were built from.
#[derive(Debug, Default)]
pub struct TypeGraph {
    types: Vec<Descriptor>,
    by_die: HashMap<DieOffset, TypeId>,
}

impl TypeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn get(&self, id: TypeId) -> &Descriptor {
        &self.types[id]
    }

    pub fn push(&mut self, descriptor: Descriptor) -> TypeId {
        self.types.push(descriptor);
        self.types.len() - 1
    }

    #[inline(always)]
    pub fn lookup(&self, die: DieOffset) -> Option<TypeId> {
        self.by_die.get(&die).copied()
    }

    fn bind(&mut self, die: DieOffset, id: TypeId) {
        self.by_die.insert(die, id);
    }

    fn replace(&mut self, id: TypeId, descriptor: Descriptor) {
        self.types[id] = descriptor;
    }

    /// Byte size of a descriptor. Pointers are 8 bytes, the target is a
    /// little-endian 64-bit machine.
    pub fn size_of(&self, id: TypeId) -> u64 {
        match &self.types[id] {
            Descriptor::Base { size, .. } => *size,
            Descriptor::Pointer { .. } => 8,
            Descriptor::Struct { size, .. } => *size,
            Descriptor::Union { size, .. } => *size,
            Descriptor::Enum { size, .. } => *size,
            Descriptor::Opaque { size } => *size,
        }
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        matches!(&self.types[id], Descriptor::Base { signed: true, .. })
    }

    /// Resolve the symbolic name of an enumeration value.
    pub fn enum_name(&self, id: TypeId, value: i64) -> Option<&str> {
        match &self.types[id] {
            Descriptor::Enum { enumerators, .. } => enumerators.get(&value).map(String::as_str),
            _ => None,
        }
    }

    /// Human-readable type name, for diagnostics.
    pub fn type_name(&self, id: TypeId) -> String {
        match &self.types[id] {
            Descriptor::Base { name, .. } => name.clone(),
            Descriptor::Pointer { target: Some(t) } => format!("*{}", self.type_name(*t)),
            Descriptor::Pointer { target: None } => "*void".to_string(),
            Descriptor::Struct { name, .. } => {
                format!("struct {}", name.as_deref().unwrap_or("<anonymous>"))
            }
            Descriptor::Union { name, .. } => {
                format!("union {}", name.as_deref().unwrap_or("<anonymous>"))
            }
            Descriptor::Enum { name, .. } => {
                format!("enum {}", name.as_deref().unwrap_or("<anonymous>"))
            }
            Descriptor::Opaque { size } => format!("opaque[{size}]"),
        }
    }
}

/// Synthesize (and memoize) the descriptor for the type DIE at `offset`.
///
/// `typedef`, `const_type`, `member` and `variable` DIEs forward to their
/// `DW_AT_type`; array types decay to a pointer to the element type. Any tag
/// outside the supported set is an error naming the tag.
pub(super) fn synthesize(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    graph: &mut TypeGraph,
    offset: DieOffset,
) -> Result<TypeId, Error> {
    if let Some(id) = graph.lookup(offset) {
        return Ok(id);
    }

    let die = unit.entry(offset)?;
    let tag = die.tag();
    match tag {
        gimli::DW_TAG_structure_type => synth_record(dwarf, unit, graph, offset, false),
        gimli::DW_TAG_union_type => synth_record(dwarf, unit, graph, offset, true),
        gimli::DW_TAG_enumeration_type => synth_enum(dwarf, unit, graph, offset),
        gimli::DW_TAG_base_type => {
            let name = die_name(dwarf, unit, &die)?.unwrap_or_default();
            let size = udata_attr(&die, DW_AT_byte_size)?.unwrap_or(0);
            let signed = is_signed_encoding(die.attr_value(DW_AT_encoding)?);
            let id = graph.push(Descriptor::Base { name, size, signed });
            graph.bind(offset, id);
            Ok(id)
        }
        gimli::DW_TAG_pointer_type | gimli::DW_TAG_array_type => {
            let target_ref = type_ref(&die)?;
            let id = graph.push(Descriptor::Pointer { target: None });
            graph.bind(offset, id);
            if let Some(target) = target_ref {
                let target_id = synthesize(dwarf, unit, graph, target)?;
                graph.replace(
                    id,
                    Descriptor::Pointer {
                        target: Some(target_id),
                    },
                );
            }
            Ok(id)
        }
        gimli::DW_TAG_subroutine_type => {
            let id = graph.push(Descriptor::Pointer { target: None });
            graph.bind(offset, id);
            Ok(id)
        }
        gimli::DW_TAG_typedef
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_member
        | gimli::DW_TAG_variable => {
            let target = type_ref(&die)?.ok_or_else(|| Error::MissingAttribute {
                die: describe(dwarf, unit, offset, tag),
                attr: "DW_AT_type",
            })?;
            let id = synthesize(dwarf, unit, graph, target)?;
            graph.bind(offset, id);
            Ok(id)
        }
        tag => Err(Error::UnsupportedDie(tag)),
    }
}

fn synth_record(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    graph: &mut TypeGraph,
    offset: DieOffset,
    is_union: bool,
) -> Result<TypeId, Error> {
    let die = unit.entry(offset)?;
    let name = die_name(dwarf, unit, &die)?;
    let size = udata_attr(&die, DW_AT_byte_size)?.unwrap_or(0);

    // The placeholder goes into the cache before members are walked, so a
    // member chain that leads back here resolves to a buffer of the right
    // size instead of recursing forever.
    let id = graph.push(Descriptor::Opaque { size });
    graph.bind(offset, id);

    let mut fields = vec![];
    let mut cursor = 0u64;
    for member in children_of(unit, offset, gimli::DW_TAG_member)? {
        let mdie = unit.entry(member)?;
        let mname = die_name(dwarf, unit, &mdie)?;
        let location = udata_attr(&mdie, DW_AT_data_member_location)?.unwrap_or(0);
        let mtype = type_ref(&mdie)?.ok_or_else(|| Error::MissingAttribute {
            die: describe(dwarf, unit, member, gimli::DW_TAG_member),
            attr: "DW_AT_type",
        })?;
        let type_id = synthesize(dwarf, unit, graph, mtype)?;

        if is_union {
            fields.push(Field {
                offset: 0,
                name: mname,
                type_id,
            });
            continue;
        }
        if cursor < location {
            let pad = graph.push(Descriptor::Opaque {
                size: location - cursor,
            });
            fields.push(Field {
                offset: cursor,
                name: None,
                type_id: pad,
            });
        }
        cursor = location + graph.size_of(type_id);
        fields.push(Field {
            offset: location,
            name: mname,
            type_id,
        });
    }
    if !is_union && cursor < size {
        let pad = graph.push(Descriptor::Opaque {
            size: size - cursor,
        });
        fields.push(Field {
            offset: cursor,
            name: None,
            type_id: pad,
        });
    }

    let descriptor = if is_union {
        Descriptor::Union { name, size, fields }
    } else {
        Descriptor::Struct { name, size, fields }
    };
    graph.replace(id, descriptor);
    Ok(id)
}

fn synth_enum(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    graph: &mut TypeGraph,
    offset: DieOffset,
) -> Result<TypeId, Error> {
    let die = unit.entry(offset)?;
    let name = die_name(dwarf, unit, &die)?;
    let backing = type_ref(&die)?;
    let mut size = udata_attr(&die, DW_AT_byte_size)?;
    if size.is_none() {
        if let Some(backing) = backing {
            let backing_id = synthesize(dwarf, unit, graph, backing)?;
            size = Some(graph.size_of(backing_id));
        }
    }

    let mut enumerators = HashMap::new();
    for child in children_of(unit, offset, gimli::DW_TAG_enumerator)? {
        let edie = unit.entry(child)?;
        let ename = die_name(dwarf, unit, &edie)?.ok_or_else(|| Error::MissingAttribute {
            die: describe(dwarf, unit, child, gimli::DW_TAG_enumerator),
            attr: "DW_AT_name",
        })?;
        let evalue = const_value(&edie)?.ok_or_else(|| Error::MissingAttribute {
            die: describe(dwarf, unit, child, gimli::DW_TAG_enumerator),
            attr: "DW_AT_const_value",
        })?;
        enumerators.insert(evalue, ename);
    }

    let id = graph.push(Descriptor::Enum {
        name,
        size: size.unwrap_or(4),
        enumerators,
    });
    graph.bind(offset, id);
    Ok(id)
}

fn children_of(
    unit: &gimli::Unit<EndianArcSlice>,
    offset: DieOffset,
    want: DwTag,
) -> Result<Vec<DieOffset>, Error> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut offsets = vec![];
    let mut children = root.children();
    while let Some(child) = children.next()? {
        if child.entry().tag() == want {
            offsets.push(child.entry().offset());
        }
    }
    Ok(offsets)
}

fn is_signed_encoding(attr: Option<AttributeValue<EndianArcSlice>>) -> bool {
    let encoding = match attr {
        Some(AttributeValue::Encoding(enc)) => Some(enc),
        Some(AttributeValue::Udata(v)) => Some(gimli::DwAte(v as u8)),
        _ => None,
    };
    matches!(
        encoding,
        Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char)
    )
}

fn describe(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    offset: DieOffset,
    tag: DwTag,
) -> String {
    let name = unit
        .entry(offset)
        .ok()
        .and_then(|die| die_name(dwarf, unit, &die).ok().flatten());
    match name {
        Some(name) => format!("{tag} `{name}`"),
        None => format!("{tag} at {:#x}", offset.0),
    }
}

pub mod descriptor;
pub mod elf;

use crate::audit::error::Error;
use bytes::Bytes;
use descriptor::{TypeGraph, TypeId};
use elf::ElfImage;
use fallible_iterator::FallibleIterator;
use gimli::{AttributeValue, DwTag, DwarfFileType, Reader, RunTimeEndian, SectionId};
use std::collections::HashMap;
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Offset of a DIE inside the single compilation unit.
pub type DieOffset = gimli::UnitOffset<usize>;

const REQUIRED_SECTIONS: [&str; 3] = ["debug_info", "debug_abbrev", "debug_str"];

/// Loader over the split-DWARF object embedded in an audit log.
///
/// The audit log describes every raw memory image it carries only through
/// these debugging information entries, so the loader is the source of truth
/// for all structure layouts, enumerations and constants of the traced
/// runtime. gimli decodes the abbreviation tables and attribute forms; the
/// loader owns the name index and the descriptor synthesis on top.
pub struct DwarfLoader {
    dwarf: gimli::Dwarf<EndianArcSlice>,
    unit: gimli::Unit<EndianArcSlice>,
    name_index: HashMap<String, DieOffset>,
    graph: TypeGraph,
}

impl DwarfLoader {
    /// Parse the embedded ELF object and load the debug sections found in
    /// it. Section names are stored with their `.<name>.dwo` envelope
    /// stripped; sections the loader has no use for are ignored.
    pub fn from_elf(blob: &[u8]) -> Result<Self, Error> {
        let image = ElfImage::parse(blob)?;
        let mut sections = HashMap::new();
        for (name, data) in image.named_sections()? {
            let stripped = name
                .trim_start_matches('.')
                .trim_end_matches(".dwo")
                .to_string();
            sections.insert(stripped, data);
        }
        Self::load(sections)
    }

    /// Build the loader from raw section bytes keyed by stripped name.
    pub fn load(sections: HashMap<String, Bytes>) -> Result<Self, Error> {
        for required in REQUIRED_SECTIONS {
            if !sections.contains_key(required) {
                return Err(Error::NoDebugInformation(required));
            }
        }

        let mut dwarf = gimli::Dwarf::load(|id: SectionId| -> Result<EndianArcSlice, Error> {
            let data = sections
                .get(id.name().trim_start_matches('.'))
                .cloned()
                .unwrap_or_default();
            Ok(EndianArcSlice::new(
                Arc::from(&data[..]),
                RunTimeEndian::Little,
            ))
        })?;
        dwarf.file_type = DwarfFileType::Dwo;

        let headers: Vec<_> = dwarf.units().collect()?;
        if headers.len() > 1 {
            log::warn!(target: "audit", "multiple compilation units, using the first");
        }
        let header = headers
            .into_iter()
            .next()
            .ok_or(Error::NoDebugInformation("compilation unit"))?;
        let unit = dwarf.unit(header)?;

        let mut name_index = HashMap::new();
        {
            let mut cursor = unit.entries();
            while let Some((_, die)) = cursor.next_dfs()? {
                if let Some(name) = die_name(&dwarf, &unit, die)? {
                    name_index.entry(name).or_insert(die.offset());
                }
            }
        }

        Ok(Self {
            dwarf,
            unit,
            name_index,
            graph: TypeGraph::new(),
        })
    }

    /// First DIE carrying the given `DW_AT_name`, regardless of tag.
    #[inline(always)]
    pub fn find_die(&self, name: &str) -> Option<DieOffset> {
        self.name_index.get(name).copied()
    }

    pub fn die_tag(&self, offset: DieOffset) -> Result<DwTag, Error> {
        Ok(self.unit.entry(offset)?.tag())
    }

    /// `DW_AT_const_value` of the named DIE (an enumerator or a constant
    /// variable). The runtime publishes its tuning constants this way.
    pub fn constant(&self, name: &str) -> Option<i64> {
        let offset = self.find_die(name)?;
        let die = self.unit.entry(offset).ok()?;
        const_value(&die).ok()?
    }

    /// Synthesize (memoized) the layout descriptor for a type DIE.
    pub fn descriptor_of(&mut self, offset: DieOffset) -> Result<TypeId, Error> {
        descriptor::synthesize(&self.dwarf, &self.unit, &mut self.graph, offset)
    }

    /// Shorthand: find the DIE by name and synthesize its descriptor.
    pub fn descriptor_of_name(&mut self, name: &str) -> Result<TypeId, Error> {
        let offset = self
            .find_die(name)
            .ok_or_else(|| Error::DieNotFound(name.to_string()))?;
        self.descriptor_of(offset)
    }

    #[inline(always)]
    pub fn graph(&self) -> &TypeGraph {
        &self.graph
    }

    #[inline(always)]
    pub fn graph_mut(&mut self) -> &mut TypeGraph {
        &mut self.graph
    }

    /// Resolve the symbolic name of an enumeration value.
    #[inline(always)]
    pub fn enum_name(&self, type_id: TypeId, value: i64) -> Option<&str> {
        self.graph.enum_name(type_id, value)
    }
}

pub(super) fn die_name(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &gimli::Unit<EndianArcSlice>,
    die: &gimli::DebuggingInformationEntry<EndianArcSlice, usize>,
) -> Result<Option<String>, Error> {
    let Some(attr) = die.attr_value(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let value = dwarf.attr_string(unit, attr)?;
    Ok(Some(value.to_string_lossy()?.into_owned()))
}

pub(super) fn type_ref(
    die: &gimli::DebuggingInformationEntry<EndianArcSlice, usize>,
) -> Result<Option<DieOffset>, Error> {
    match die.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

pub(super) fn udata_attr(
    die: &gimli::DebuggingInformationEntry<EndianArcSlice, usize>,
    at: gimli::DwAt,
) -> Result<Option<u64>, Error> {
    Ok(die.attr_value(at)?.and_then(|value| value.udata_value()))
}

pub(super) fn const_value(
    die: &gimli::DebuggingInformationEntry<EndianArcSlice, usize>,
) -> Result<Option<i64>, Error> {
    let Some(value) = die.attr_value(gimli::DW_AT_const_value)? else {
        return Ok(None);
    };
    Ok(value
        .sdata_value()
        .or_else(|| value.udata_value().map(|v| v as i64)))
}

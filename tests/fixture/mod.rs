//! Builders for synthetic audit logs: a DWARF object describing the traced
//! runtime's types, raw memory images laid out to match, and the msgpack
//! record stream tying them together. Tests pin their expectations against
//! the addresses and values below.

#![allow(dead_code)]

use std::collections::HashMap;

// ------------------------------- fixture addresses -----------------------------------------------

pub const PROTO1: u64 = 0x4000;
pub const PROTO2: u64 = 0x4100;
pub const CHUNKNAME_STR: u64 = 0x5000;
pub const HELLO_STR: u64 = 0x5100;
pub const FUNC1: u64 = 0x5200;
pub const BCLOG: u64 = 0x6000;
pub const JIT_STATE_21: u64 = 0x7000;
pub const JIT_STATE_25: u64 = 0x7100;
pub const JIT_STATE_ORPHAN: u64 = 0x7200;
pub const TRACE_21: u64 = 0x8000;
pub const TRACE_25: u64 = 0x8100;
pub const TRACE_22: u64 = 0x8200;
pub const IR_PTR_21: u64 = 0x8800;
pub const IR_PTR_25: u64 = 0x8c00;
pub const IR_PTR_22: u64 = 0x8d00;
pub const SNAP: u64 = 0x8900;
pub const SNAPMAP: u64 = 0x8980;
pub const MCODE: u64 = 0x8a00;
pub const SZIRMCODE: u64 = 0x8b00;
pub const IR_MODE_TABLE: u64 = 0x9000;
pub const MISSING_GCSTR: u64 = 0xdead;

pub const REF_BIAS: u64 = 0x8000;
pub const NK_21: u64 = 0x7ffb;
pub const NINS_21: u64 = 0x8005;
pub const NK_22: u64 = 0x7ffe;
pub const NK_25: u64 = 0x8000;
pub const NINS_2: u64 = 0x8002;

pub const GCPROTO_SIZE: usize = 64;
pub const GCSTR_SIZE: usize = 24;

// fixture IROp numbering
pub const IR_KPRI: u8 = 0;
pub const IR_KINT: u8 = 1;
pub const IR_KGC: u8 = 2;
pub const IR_KNUM: u8 = 6;
pub const IR_BASE: u8 = 9;
pub const IR_ADD: u8 = 10;
pub const IR_SLOAD: u8 = 11;
pub const IR_CONV: u8 = 12;
pub const IR_NOP: u8 = 14;

// fixture IRType numbering
pub const IRT_STR: u8 = 4;
pub const IRT_NUM: u8 = 13;
pub const IRT_INT: u8 = 18;

// ------------------------------- DWARF object builder --------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRef(usize);

/// Emits `.debug_abbrev`/`.debug_info`/`.debug_str` byte-for-byte: a single
/// DWARF 4 compilation unit, one abbreviation per DIE shape, `strp` names
/// and `ref4` type references (patched after the tree is written).
pub struct DwarfBuilder {
    dies: Vec<u8>,
    strings: Vec<u8>,
    string_cache: HashMap<String, u32>,
    offsets: Vec<Option<u32>>,
    patches: Vec<(usize, TypeRef)>,
}

const UNIT_HEADER_LEN: u32 = 11;

const DW_ATE_SIGNED: u8 = 0x05;
const DW_ATE_UNSIGNED: u8 = 0x07;
const DW_ATE_FLOAT: u8 = 0x04;

impl DwarfBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            dies: vec![],
            strings: vec![],
            string_cache: HashMap::new(),
            offsets: vec![],
            patches: vec![],
        };
        // root compile unit, abbrev 1
        builder.uleb(1);
        let name = builder.strp("lj_dwarf.c");
        builder.u32(name);
        builder
    }

    pub fn reserve(&mut self) -> TypeRef {
        self.offsets.push(None);
        TypeRef(self.offsets.len() - 1)
    }

    fn mark(&mut self, id: TypeRef) {
        self.offsets[id.0] = Some(self.dies.len() as u32);
    }

    pub fn base_type(&mut self, name: &str, size: u8, encoding: u8) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(2);
        let name = self.strp(name);
        self.u32(name);
        self.dies.push(size);
        self.dies.push(encoding);
        id
    }

    pub fn unsigned(&mut self, name: &str, size: u8) -> TypeRef {
        self.base_type(name, size, DW_ATE_UNSIGNED)
    }

    pub fn signed(&mut self, name: &str, size: u8) -> TypeRef {
        self.base_type(name, size, DW_ATE_SIGNED)
    }

    pub fn double(&mut self, name: &str) -> TypeRef {
        self.base_type(name, 8, DW_ATE_FLOAT)
    }

    /// Structure with named members; `fields` are (name, type, offset).
    pub fn structure(&mut self, name: &str, size: u16, fields: &[(&str, TypeRef, u16)]) -> TypeRef {
        let id = self.reserve();
        self.structure_at(id, name, size, fields);
        id
    }

    /// Same, into a reserved id (for self-referential types).
    pub fn structure_at(
        &mut self,
        id: TypeRef,
        name: &str,
        size: u16,
        fields: &[(&str, TypeRef, u16)],
    ) {
        self.mark(id);
        self.uleb(3);
        let name = self.strp(name);
        self.u32(name);
        self.u16(size);
        for (fname, ftype, foffset) in fields {
            self.member(fname, *ftype, *foffset);
        }
        self.dies.push(0);
    }

    pub fn union(&mut self, name: &str, size: u16, fields: &[(&str, TypeRef)]) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(13);
        let name = self.strp(name);
        self.u32(name);
        self.u16(size);
        for (fname, ftype) in fields {
            self.member(fname, *ftype, 0);
        }
        self.dies.push(0);
        id
    }

    fn member(&mut self, name: &str, ftype: TypeRef, offset: u16) {
        self.uleb(4);
        let name = self.strp(name);
        self.u32(name);
        self.ref4(ftype);
        self.u16(offset);
    }

    pub fn pointer(&mut self, target: TypeRef) -> TypeRef {
        let id = self.reserve();
        self.pointer_at(id, target);
        id
    }

    pub fn pointer_at(&mut self, id: TypeRef, target: TypeRef) {
        self.mark(id);
        self.uleb(5);
        self.ref4(target);
    }

    pub fn opaque_pointer(&mut self) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(6);
        id
    }

    pub fn enumeration(&mut self, name: &str, size: u8, values: &[(&str, u32)]) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(7);
        let name = self.strp(name);
        self.u32(name);
        self.dies.push(size);
        self.enumerators(values);
        id
    }

    /// Anonymous enumeration, the runtime's way of publishing constants.
    pub fn constants(&mut self, values: &[(&str, u32)]) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(8);
        self.dies.push(4);
        self.enumerators(values);
        id
    }

    fn enumerators(&mut self, values: &[(&str, u32)]) {
        for (name, value) in values {
            self.uleb(9);
            let name = self.strp(name);
            self.u32(name);
            self.u32(*value);
        }
        self.dies.push(0);
    }

    pub fn variable(&mut self, name: &str, ty: TypeRef) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(10);
        let name = self.strp(name);
        self.u32(name);
        self.ref4(ty);
        id
    }

    pub fn typedef(&mut self, name: &str, ty: TypeRef) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(11);
        let name = self.strp(name);
        self.u32(name);
        self.ref4(ty);
        id
    }

    pub fn array(&mut self, element: TypeRef) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(12);
        self.ref4(element);
        id
    }

    pub fn subprogram(&mut self, name: &str) -> TypeRef {
        let id = self.reserve();
        self.mark(id);
        self.uleb(14);
        let name = self.strp(name);
        self.u32(name);
        id
    }

    /// Assemble `.debug_info`, `.debug_abbrev` and `.debug_str`.
    pub fn finish(mut self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        self.dies.push(0); // end of compile-unit children

        for (at, target) in &self.patches {
            let offset = self.offsets[target.0].expect("referenced DIE was never emitted")
                + UNIT_HEADER_LEN;
            self.dies[*at..at + 4].copy_from_slice(&offset.to_le_bytes());
        }

        let mut info = vec![];
        let unit_length = UNIT_HEADER_LEN - 4 + self.dies.len() as u32;
        info.extend_from_slice(&unit_length.to_le_bytes());
        info.extend_from_slice(&4u16.to_le_bytes()); // DWARF version
        info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        info.push(8); // address size
        info.extend_from_slice(&self.dies);

        (info, abbrev_table(), self.strings)
    }

    fn strp(&mut self, s: &str) -> u32 {
        if let Some(offset) = self.string_cache.get(s) {
            return *offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        self.string_cache.insert(s.to_string(), offset);
        offset
    }

    fn ref4(&mut self, target: TypeRef) {
        self.patches.push((self.dies.len(), target));
        self.u32(0);
    }

    fn uleb(&mut self, value: u8) {
        assert!(value < 0x80);
        self.dies.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.dies.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.dies.extend_from_slice(&value.to_le_bytes());
    }
}

/// The static abbreviation table matching the codes used above.
fn abbrev_table() -> Vec<u8> {
    const DW_TAG_ARRAY: u8 = 0x01;
    const DW_TAG_ENUM: u8 = 0x04;
    const DW_TAG_MEMBER: u8 = 0x0d;
    const DW_TAG_POINTER: u8 = 0x0f;
    const DW_TAG_CU: u8 = 0x11;
    const DW_TAG_STRUCT: u8 = 0x13;
    const DW_TAG_TYPEDEF: u8 = 0x16;
    const DW_TAG_UNION: u8 = 0x17;
    const DW_TAG_BASE: u8 = 0x24;
    const DW_TAG_ENUMERATOR: u8 = 0x28;
    const DW_TAG_SUBPROGRAM: u8 = 0x2e;
    const DW_TAG_VARIABLE: u8 = 0x34;

    const DW_AT_NAME: u8 = 0x03;
    const DW_AT_BYTE_SIZE: u8 = 0x0b;
    const DW_AT_CONST_VALUE: u8 = 0x1c;
    const DW_AT_DATA_MEMBER_LOCATION: u8 = 0x38;
    const DW_AT_ENCODING: u8 = 0x3e;
    const DW_AT_TYPE: u8 = 0x49;

    const DW_FORM_DATA2: u8 = 0x05;
    const DW_FORM_DATA4: u8 = 0x06;
    const DW_FORM_DATA1: u8 = 0x0b;
    const DW_FORM_STRP: u8 = 0x0e;
    const DW_FORM_REF4: u8 = 0x13;

    let mut out = vec![];
    let mut entry = |code: u8, tag: u8, children: bool, attrs: &[(u8, u8)]| {
        out.push(code);
        out.push(tag);
        out.push(children as u8);
        for (at, form) in attrs {
            out.push(*at);
            out.push(*form);
        }
        out.push(0);
        out.push(0);
    };

    entry(1, DW_TAG_CU, true, &[(DW_AT_NAME, DW_FORM_STRP)]);
    entry(
        2,
        DW_TAG_BASE,
        false,
        &[
            (DW_AT_NAME, DW_FORM_STRP),
            (DW_AT_BYTE_SIZE, DW_FORM_DATA1),
            (DW_AT_ENCODING, DW_FORM_DATA1),
        ],
    );
    entry(
        3,
        DW_TAG_STRUCT,
        true,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_BYTE_SIZE, DW_FORM_DATA2)],
    );
    entry(
        4,
        DW_TAG_MEMBER,
        false,
        &[
            (DW_AT_NAME, DW_FORM_STRP),
            (DW_AT_TYPE, DW_FORM_REF4),
            (DW_AT_DATA_MEMBER_LOCATION, DW_FORM_DATA2),
        ],
    );
    entry(5, DW_TAG_POINTER, false, &[(DW_AT_TYPE, DW_FORM_REF4)]);
    entry(6, DW_TAG_POINTER, false, &[]);
    entry(
        7,
        DW_TAG_ENUM,
        true,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_BYTE_SIZE, DW_FORM_DATA1)],
    );
    entry(8, DW_TAG_ENUM, true, &[(DW_AT_BYTE_SIZE, DW_FORM_DATA1)]);
    entry(
        9,
        DW_TAG_ENUMERATOR,
        false,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_CONST_VALUE, DW_FORM_DATA4)],
    );
    entry(
        10,
        DW_TAG_VARIABLE,
        false,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_TYPE, DW_FORM_REF4)],
    );
    entry(
        11,
        DW_TAG_TYPEDEF,
        false,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_TYPE, DW_FORM_REF4)],
    );
    entry(12, DW_TAG_ARRAY, false, &[(DW_AT_TYPE, DW_FORM_REF4)]);
    entry(
        13,
        DW_TAG_UNION,
        true,
        &[(DW_AT_NAME, DW_FORM_STRP), (DW_AT_BYTE_SIZE, DW_FORM_DATA2)],
    );
    entry(14, DW_TAG_SUBPROGRAM, false, &[(DW_AT_NAME, DW_FORM_STRP)]);
    out.push(0);
    out
}

// ------------------------------- ELF object builder ----------------------------------------------

/// Wrap named sections into a minimal 64-bit little-endian relocatable ELF.
pub fn elf_object(sections: &[(&str, &[u8])]) -> Vec<u8> {
    const EHDR: usize = 64;
    const SHDR: usize = 64;

    let mut shstrtab = vec![0u8];
    let mut name_offsets = vec![];
    for (name, _) in sections {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(name.as_bytes());
        shstrtab.push(0);
    }
    let shstrtab_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    let mut data = vec![];
    let mut data_offsets = vec![];
    for (_, bytes) in sections {
        data_offsets.push(EHDR + data.len());
        data.extend_from_slice(bytes);
    }
    let shstrtab_offset = EHDR + data.len();
    let shoff = shstrtab_offset + shstrtab.len();
    let shnum = sections.len() as u16 + 2; // null + sections + shstrtab

    let mut out = vec![0u8; EHDR];
    out[0..4].copy_from_slice(b"\x7fELF");
    out[4] = 2; // 64-bit
    out[5] = 1; // little-endian
    out[6] = 1; // ELF version
    out[0x10..0x12].copy_from_slice(&1u16.to_le_bytes()); // ET_REL
    out[0x12..0x14].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
    out[0x28..0x30].copy_from_slice(&(shoff as u64).to_le_bytes());
    out[0x34..0x36].copy_from_slice(&(EHDR as u16).to_le_bytes());
    out[0x3a..0x3c].copy_from_slice(&(SHDR as u16).to_le_bytes());
    out[0x3c..0x3e].copy_from_slice(&shnum.to_le_bytes());
    out[0x3e..0x40].copy_from_slice(&(shnum - 1).to_le_bytes());

    out.extend_from_slice(&data);
    out.extend_from_slice(&shstrtab);

    let mut shdr = |name: u32, kind: u32, offset: usize, size: usize| {
        let mut header = [0u8; SHDR];
        header[0..4].copy_from_slice(&name.to_le_bytes());
        header[4..8].copy_from_slice(&kind.to_le_bytes());
        header[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
        header[32..40].copy_from_slice(&(size as u64).to_le_bytes());
        header[48..56].copy_from_slice(&1u64.to_le_bytes()); // alignment
        header
    };

    out.extend_from_slice(&[0u8; SHDR]); // null section
    for (i, (_, bytes)) in sections.iter().enumerate() {
        let header = shdr(name_offsets[i], 1, data_offsets[i], bytes.len());
        out.extend_from_slice(&header);
    }
    let header = shdr(shstrtab_name, 3, shstrtab_offset, shstrtab.len());
    out.extend_from_slice(&header);
    out
}

/// The complete runtime type catalog as an embedded DWARF object.
pub fn dwarf_blob() -> Vec<u8> {
    let mut b = DwarfBuilder::new();

    let u8t = b.unsigned("uint8_t", 1);
    let u16t = b.unsigned("uint16_t", 2);
    let u32t = b.unsigned("uint32_t", 4);
    let u64t = b.unsigned("uint64_t", 8);
    let int = b.signed("int", 4);
    let chart = b.signed("char", 1);
    let doublet = b.double("double");

    let gcref = b.structure("GCRef", 8, &[("gcptr64", u64t, 0)]);
    let mref = b.structure("MRef", 8, &[("ptr64", u64t, 0)]);

    b.structure(
        "GCstr",
        GCSTR_SIZE as u16,
        &[
            ("nextgc", gcref, 0),
            ("marked", u8t, 8),
            ("gct", u8t, 9),
            ("reserved", u8t, 10),
            ("hash", u32t, 12),
            ("len", u32t, 16),
        ],
    );

    let char_ptr = b.pointer(chart);
    let u32_ptr = b.pointer(u32t);
    b.structure(
        "GCproto",
        GCPROTO_SIZE as u16,
        &[
            ("nextgc", gcref, 0),
            ("marked", u8t, 8),
            ("gct", u8t, 9),
            ("sizebc", u32t, 12),
            ("gclist", gcref, 16),
            ("chunkname", gcref, 24),
            ("declname", char_ptr, 32),
            ("lineinfo", u32_ptr, 40),
            ("firstline", u32t, 48),
            ("numline", u32t, 52),
        ],
    );

    let bcreclog = b.structure(
        "BCRecLog",
        16,
        &[("pt", gcref, 0), ("pos", u32t, 8), ("framedepth", int, 12)],
    );
    let bcreclog_ptr = b.pointer(bcreclog);
    b.structure(
        "jit_State",
        48,
        &[
            ("state", u32t, 0),
            ("bclog", bcreclog_ptr, 8),
            ("nbclog", u64t, 16),
            ("parent", u32t, 24),
            ("exitno", u32t, 28),
            ("startpc", mref, 32),
        ],
    );

    let irins = b.structure(
        "IRIns",
        8,
        &[
            ("op1", u16t, 0),
            ("op2", u16t, 2),
            ("t", u8t, 4),
            ("o", u8t, 5),
            ("r", u8t, 6),
            ("s", u8t, 7),
        ],
    );
    let irins_ptr = b.pointer(irins);

    let snapshot = b.structure(
        "SnapShot",
        8,
        &[
            ("ref", u16t, 0),
            ("mapofs", u16t, 2),
            ("nent", u8t, 4),
            ("topslot", u8t, 5),
        ],
    );
    let snapshot_ptr = b.pointer(snapshot);
    let u8_ptr = b.pointer(u8t);
    let u16_ptr = b.pointer(u16t);
    b.structure(
        "GCtrace",
        88,
        &[
            ("nextgc", gcref, 0),
            ("marked", u8t, 8),
            ("gct", u8t, 9),
            ("traceno", u16t, 10),
            ("nins", u32t, 12),
            ("nk", u32t, 16),
            ("ir", irins_ptr, 24),
            ("snap", snapshot_ptr, 32),
            ("nsnap", u32t, 40),
            ("nsnapmap", u32t, 44),
            ("snapmap", u32_ptr, 48),
            ("mcode", u8_ptr, 56),
            ("szmcode", u64t, 64),
            ("szirmcode", u16_ptr, 72),
        ],
    );

    b.structure(
        "GCfuncL",
        40,
        &[
            ("nextgc", gcref, 0),
            ("marked", u8t, 8),
            ("gct", u8t, 9),
            ("ffid", u8t, 10),
            ("nupvalues", u8t, 11),
            ("env", gcref, 16),
            ("gclist", gcref, 24),
            ("pc", mref, 32),
        ],
    );

    // self-referential node, exercises the cyclic layout path
    let gcnode = b.reserve();
    let gcnode_ptr = b.reserve();
    b.pointer_at(gcnode_ptr, gcnode);
    b.structure_at(gcnode, "GCnode", 16, &[("next", gcnode_ptr, 0), ("value", u64t, 8)]);

    b.union("TValue", 8, &[("u64", u64t), ("n", doublet)]);

    b.enumeration(
        "IROp",
        1,
        &[
            ("IR_KPRI", 0),
            ("IR_KINT", 1),
            ("IR_KGC", 2),
            ("IR_KPTR", 3),
            ("IR_KKPTR", 4),
            ("IR_KNULL", 5),
            ("IR_KNUM", 6),
            ("IR_KINT64", 7),
            ("IR_KSLOT", 8),
            ("IR_BASE", 9),
            ("IR_ADD", 10),
            ("IR_SLOAD", 11),
            ("IR_CONV", 12),
            ("IR_CNEWI", 13),
            ("IR_NOP", 14),
            ("IR__MAX", 15),
        ],
    );
    b.enumeration(
        "IRType",
        1,
        &[
            ("IRT_NIL", 0),
            ("IRT_FAL", 1),
            ("IRT_TRU", 2),
            ("IRT_STR", IRT_STR as u32),
            ("IRT_FUNC", 8),
            ("IRT_NUM", IRT_NUM as u32),
            ("IRT_INT", IRT_INT as u32),
            ("IRT_INTP", 21),
        ],
    );
    b.enumeration(
        "IRMode",
        1,
        &[("IRMref", 0), ("IRMlit", 1), ("IRMcst", 2), ("IRMnone", 3)],
    );
    b.enumeration(
        "TraceError",
        4,
        &[
            ("LJ_TRERR_RECERR", 0),
            ("LJ_TRERR_LLEAVE", 1),
            ("LJ_TRERR_BADTYPE", 2),
        ],
    );
    b.constants(&[
        ("REF_BIAS", REF_BIAS as u32),
        ("LJ_VMST__MAX", 11),
        ("LJ_VMPROFILE_TRACE_MAX", 64),
    ]);

    let mode_array = b.array(u8t);
    b.variable("lj_ir_mode", mode_array);

    // a tag outside the supported descriptor set
    b.subprogram("lj_trace_new");

    let (info, abbrev, strings) = b.finish();
    elf_object(&[
        (".debug_info.dwo", &info),
        (".debug_abbrev.dwo", &abbrev),
        (".debug_str.dwo", &strings),
        (".text", &[0x90]),
    ])
}

// ------------------------------- raw memory images -----------------------------------------------

pub struct Image {
    buf: Vec<u8>,
}

impl Image {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
        }
    }

    pub fn u8(mut self, offset: usize, value: u8) -> Self {
        self.buf[offset] = value;
        self
    }

    pub fn u16(mut self, offset: usize, value: u16) -> Self {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, offset: usize, value: u32) -> Self {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, offset: usize, value: u64) -> Self {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(mut self, offset: usize, value: &[u8]) -> Self {
        self.buf[offset..offset + value.len()].copy_from_slice(value);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// One 8-byte IR slot.
pub fn ir_slot(op1: u16, op2: u16, t: u8, o: u8, r: u8, s: u8) -> u64 {
    op1 as u64
        | (op2 as u64) << 16
        | (t as u64) << 32
        | (o as u64) << 40
        | (r as u64) << 48
        | (s as u64) << 56
}

pub fn ir_image(slots: &[u64]) -> Vec<u8> {
    slots.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn gcstr_image(payload: &str) -> Vec<u8> {
    Image::new(GCSTR_SIZE + payload.len())
        .u32(16, payload.len() as u32)
        .bytes(GCSTR_SIZE, payload.as_bytes())
        .build()
}

fn proto_image(address: u64, firstline: u32, bc: &[u32], lineinfo: &[u32], declname: &str) -> Vec<u8> {
    assert_eq!(bc.len(), lineinfo.len());
    let bc_off = GCPROTO_SIZE;
    let li_off = bc_off + bc.len() * 4;
    let dn_off = li_off + lineinfo.len() * 4;

    let mut image = Image::new(dn_off + declname.len() + 1)
        .u32(12, bc.len() as u32) // sizebc
        .u64(24, CHUNKNAME_STR) // chunkname
        .u64(32, address + dn_off as u64) // declname
        .u64(40, address + li_off as u64) // lineinfo
        .u32(48, firstline)
        .u32(52, lineinfo.iter().copied().max().unwrap_or(0) + 1);
    for (i, word) in bc.iter().enumerate() {
        image = image.u32(bc_off + i * 4, *word);
    }
    for (i, line) in lineinfo.iter().enumerate() {
        image = image.u32(li_off + i * 4, *line);
    }
    image.bytes(dn_off, declname.as_bytes()).build()
}

fn jit_state_image(bclog: u64, nbclog: u64, parent: u32, startpc: u64) -> Vec<u8> {
    Image::new(48)
        .u64(8, bclog)
        .u64(16, nbclog)
        .u32(24, parent)
        .u64(32, startpc)
        .build()
}

fn gctrace_image(traceno: u16, nins: u64, nk: u64, ir: u64) -> Vec<u8> {
    Image::new(88)
        .u16(10, traceno)
        .u32(12, nins as u32)
        .u32(16, nk as u32)
        .u64(24, ir)
        .u64(32, SNAP)
        .u32(40, 1)
        .u32(44, 2)
        .u64(48, SNAPMAP)
        .u64(56, MCODE)
        .u64(64, 64)
        .u64(72, SZIRMCODE)
        .build()
}

/// Operand-mode table matching the fixture's IROp numbering.
fn ir_mode_table() -> Vec<u8> {
    const REF: u8 = 0;
    const LIT: u8 = 1;
    const CST: u8 = 2;
    const NONE: u8 = 3;
    let mode = |m1: u8, m2: u8| m1 | m2 << 2;
    vec![
        mode(NONE, NONE), // KPRI
        mode(CST, CST),   // KINT
        mode(CST, CST),   // KGC
        mode(CST, CST),   // KPTR
        mode(CST, CST),   // KKPTR
        mode(NONE, NONE), // KNULL
        mode(CST, CST),   // KNUM
        mode(CST, CST),   // KINT64
        mode(REF, LIT),   // KSLOT
        mode(LIT, LIT),   // BASE
        mode(REF, REF),   // ADD
        mode(LIT, LIT),   // SLOAD
        mode(REF, LIT),   // CONV
        mode(REF, REF),   // CNEWI
        mode(NONE, NONE), // NOP
    ]
}

// ------------------------------- msgpack log builder ---------------------------------------------

#[derive(Clone)]
pub enum Field {
    U64(u64),
    Str(String),
    Bin(Vec<u8>),
}

pub struct LogBuilder {
    buf: Vec<u8>,
}

impl LogBuilder {
    pub fn new() -> Self {
        Self { buf: vec![] }
    }

    pub fn blob(mut self, name: &str, data: &[u8]) -> Self {
        self.record(&[
            ("type", Field::Str("blob".to_string())),
            ("name", Field::Str(name.to_string())),
            ("data", Field::Bin(data.to_vec())),
        ]);
        self
    }

    pub fn memory(mut self, address: u64, hint: &str, data: &[u8]) -> Self {
        self.record(&[
            ("type", Field::Str("memory".to_string())),
            ("address", Field::U64(address)),
            ("hint", Field::Str(hint.to_string())),
            ("data", Field::Bin(data.to_vec())),
        ]);
        self
    }

    pub fn event(mut self, name: &str, nanotime: u64, extra: &[(&str, Field)]) -> Self {
        let mut fields = vec![
            ("type", Field::Str("event".to_string())),
            ("event", Field::Str(name.to_string())),
            ("nanotime", Field::U64(nanotime)),
        ];
        fields.extend_from_slice(extra);
        self.record(&fields);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }

    fn record(&mut self, fields: &[(&str, Field)]) {
        assert!(fields.len() <= 15);
        self.buf.push(0x80 | fields.len() as u8);
        for (key, value) in fields {
            self.str(key);
            match value {
                Field::U64(v) => {
                    self.buf.push(0xcf);
                    self.buf.extend_from_slice(&v.to_be_bytes());
                }
                Field::Str(s) => self.str(s),
                Field::Bin(b) => {
                    self.buf.push(0xc6);
                    self.buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    self.buf.extend_from_slice(b);
                }
            }
        }
    }

    fn str(&mut self, s: &str) {
        self.buf.push(0xda);
        self.buf
            .extend_from_slice(&(s.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }
}

// ------------------------------- complete fixtures -----------------------------------------------

/// Bytecode words of the first prototype; position 0 is `KSHORT 0, 1`.
pub fn proto1_bc() -> Vec<u32> {
    vec![
        41 | 1 << 16,                  // KSHORT a=0 d=1
        32 | 2 << 8 | 1 << 16,         // ADDVV a=2 c=1 b=0
        88 | (0x8000 - 3) << 16,       // JMP back 3
        75 | 1 << 16,                  // RET0 d=1
    ]
}

/// IR slots of trace 21: five constant slots, the base anchor, three
/// rendered instructions and the trailing scratch slot.
pub fn trace21_ir() -> Vec<u64> {
    vec![
        ir_slot(42, 0, IRT_INT, IR_KINT, 0, 0),
        ir_slot(0, 0, IRT_NUM, IR_KNUM, 0, 0),
        3.5f64.to_bits(),
        ir_slot(0, 0, IRT_STR, IR_KGC, 0, 0),
        HELLO_STR,
        ir_slot(0, 0, 0, IR_BASE, 0, 0),
        ir_slot(1, 0x5, IRT_NUM, IR_SLOAD, 0, 1),
        ir_slot(0x8001, 0x7ffb, IRT_NUM, IR_ADD, 253, 0),
        ir_slot(0x8002, IRT_INT as u16 | 0x800, IRT_INT, IR_CONV, 1, 0),
        ir_slot(0, 0, 0, IR_NOP, 0, 0),
    ]
}

/// An audit log holding only the embedded DWARF object.
pub fn dwarf_only_log() -> Vec<u8> {
    LogBuilder::new().blob("lj_dwarf.dwo", &dwarf_blob()).build()
}

/// The full fixture log: two prototypes, one ctype, three traces and two
/// aborts (one matching trace 25's start id, one orphan).
pub fn audit_log() -> Vec<u8> {
    let ir21_addr = IR_PTR_21 + NK_21 * 8;
    let ir22_addr = IR_PTR_22 + NK_22 * 8;
    let ir25_addr = IR_PTR_25 + NK_25 * 8;

    let bclog = [
        (PROTO1, 0u32, 0i32),
        (PROTO2, 1, 1),
        (0x9999u64, 0, 2),
        (PROTO1, 2, 0),
    ];
    let mut bclog_image = Image::new(bclog.len() * 16);
    for (i, (pt, pos, depth)) in bclog.iter().enumerate() {
        bclog_image = bclog_image
            .u64(i * 16, *pt)
            .u32(i * 16 + 8, *pos)
            .u32(i * 16 + 12, *depth as u32);
    }

    let trace22_ir = vec![
        ir_slot(0, 0, IRT_STR, IR_KGC, 0, 0),
        MISSING_GCSTR,
        ir_slot(0, 0, 0, IR_BASE, 0, 0),
        ir_slot(0, 0, 0, IR_NOP, 0, 0),
    ];
    let trace25_ir = vec![
        ir_slot(0, 0, 0, IR_BASE, 0, 0),
        ir_slot(0, 0, 0, IR_NOP, 0, 0),
    ];

    LogBuilder::new()
        .blob("lj_dwarf.dwo", &dwarf_blob())
        .memory(IR_MODE_TABLE, "lj_ir_mode", &ir_mode_table())
        .memory(CHUNKNAME_STR, "GCstr", &gcstr_image("test.lua"))
        .memory(HELLO_STR, "GCstr", &gcstr_image("hello"))
        .memory(
            FUNC1,
            "GCfuncL",
            &Image::new(40).u64(32, PROTO1 + GCPROTO_SIZE as u64).build(),
        )
        .memory(
            PROTO1,
            "GCproto",
            &proto_image(PROTO1, 10, &proto1_bc(), &[0, 1, 1, 2], "f1"),
        )
        .event("new_prototype", 1000, &[("GCproto", Field::U64(PROTO1))])
        .memory(
            PROTO2,
            "GCproto",
            &proto_image(PROTO2, 20, &[41 | 7 << 16, 76 | 2 << 16], &[0, 1], "f2"),
        )
        .event("new_prototype", 2000, &[("GCproto", Field::U64(PROTO2))])
        .event(
            "new_ctypeid",
            3000,
            &[
                ("id", Field::U64(96)),
                ("desc", Field::Str("struct foo".to_string())),
            ],
        )
        .event("lex", 3500, &[])
        .memory(BCLOG, "BCRecLog", &bclog_image.build())
        .memory(
            JIT_STATE_21,
            "jit_State",
            &jit_state_image(BCLOG, 4, 0, 0xaaaa),
        )
        .memory(
            TRACE_21,
            "GCtrace",
            &gctrace_image(21, NINS_21, NK_21, IR_PTR_21),
        )
        .memory(ir21_addr, "IRIns", &ir_image(&trace21_ir()))
        .memory(SNAP, "SnapShot", &[0u8; 8])
        .memory(SNAPMAP, "uint32_t", &[0u8; 8])
        .memory(MCODE, "uint8_t", &[0u8; 64])
        .memory(SZIRMCODE, "uint16_t", &[0u8; 8])
        .event(
            "trace_stop",
            4000,
            &[
                ("GCtrace", Field::U64(TRACE_21)),
                ("jit_State", Field::U64(JIT_STATE_21)),
            ],
        )
        .memory(
            TRACE_22,
            "GCtrace",
            &gctrace_image(22, NINS_2, NK_22, IR_PTR_22),
        )
        .memory(ir22_addr, "IRIns", &ir_image(&trace22_ir))
        .event(
            "trace_stop",
            4500,
            &[
                ("GCtrace", Field::U64(TRACE_22)),
                ("jit_State", Field::U64(JIT_STATE_21)),
            ],
        )
        .memory(
            JIT_STATE_25,
            "jit_State",
            &jit_state_image(0, 0, 21, 0xbbbb),
        )
        .memory(
            TRACE_25,
            "GCtrace",
            &gctrace_image(25, NINS_2, NK_25, IR_PTR_25),
        )
        .memory(ir25_addr, "IRIns", &ir_image(&trace25_ir))
        .event(
            "trace_stop",
            5000,
            &[
                ("GCtrace", Field::U64(TRACE_25)),
                ("jit_State", Field::U64(JIT_STATE_25)),
            ],
        )
        .event(
            "trace_abort",
            6000,
            &[
                ("jit_State", Field::U64(JIT_STATE_25)),
                ("TraceError", Field::U64(1)),
            ],
        )
        .memory(
            JIT_STATE_ORPHAN,
            "jit_State",
            &jit_state_image(0, 0, 0, 0xcccc),
        )
        .event(
            "trace_abort",
            7000,
            &[
                ("jit_State", Field::U64(JIT_STATE_ORPHAN)),
                ("TraceError", Field::U64(2)),
            ],
        )
        .build()
}

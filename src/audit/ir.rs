//! Reassembly of a trace's SSA-like intermediate representation.
//!
//! The IR address space is biased: references below `REF_BIAS` name
//! constants, references at or above it name emitted instructions. The
//! captured image starts at the lowest constant (`trace.nk`), so the
//! decoder exposes a single zero-based slot view covering `[0, nk)` for
//! constants and `[nk, ...)` for instructions, with `nk = REF_BIAS −
//! trace.nk`. Opcode, type and operand-mode names all come from the
//! runtime's own enumerations in DWARF.

use crate::audit::dwarf::descriptor::TypeId;
use crate::audit::error::Error;
use crate::audit::trace::Trace;
use crate::audit::AuditModel;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

/// Enumeration descriptors and constants required for IR decoding,
/// resolved from DWARF once at load time.
#[derive(Debug)]
pub(crate) struct IrTables {
    pub irop: TypeId,
    pub irtype: TypeId,
    pub irmode: TypeId,
    pub ir_max: i64,
    pub ref_bias: u64,
    /// The `lj_ir_mode` image: one operand-mode byte per opcode.
    pub mode: Bytes,
}

/// Opcodes whose 64-bit payload occupies the following slot.
const CONST64_OPS: [&str; 5] = ["kgc", "kptr", "kkptr", "knum", "kint64"];

/// Opcodes whose second operand renders as a plain index literal.
const INDEX_OPS: [&str; 11] = [
    "fpmath", "urefo", "urefc", "fref", "fload", "calln", "calll", "calls", "base", "pval",
    "rename",
];

const SLOAD_FLAGS: [(u16, char); 6] = [
    (0x01, 'P'),
    (0x02, 'F'),
    (0x04, 'T'),
    (0x08, 'C'),
    (0x10, 'R'),
    (0x20, 'I'),
];

const XLOAD_FLAGS: [(u16, char); 3] = [(0x01, 'R'), (0x02, 'V'), (0x04, 'U')];

/// Sign-extension bit of a conversion's operand descriptor.
const CONV_SEXT: u16 = 0x800;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Reference to another slot of the zero-based IR view.
    Ref(usize),
    /// 16-bit literal.
    Lit(u16),
    /// 32-bit immediate occupying both operand fields.
    Cst(i32),
    /// Index literal (`#n` in renderings).
    Index(u16),
    /// Decoded flag bitfield.
    Flags(String),
    /// C-type operand with its registered description, if any.
    Ctype { id: u32, desc: Option<String> },
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Konst {
    Num(f64),
    Int(i32),
    Uint64(u64),
    Ptr(u64),
    Str(String),
    /// A function constant, resolved through the function's prototype.
    Func { proto: u64, name: String },
    /// A primitive constant carrying only its type.
    Pri(String),
}

/// One decoded IR slot.
#[derive(Debug, Clone, PartialEq)]
pub struct IrIns {
    /// Zero-based slot index in the combined constant/instruction view.
    pub idx: usize,
    pub opcode: String,
    pub ty: Option<String>,
    pub reg: u8,
    pub slot: u8,
    /// The value was sunk into a side exit instead of being allocated.
    pub sunk: bool,
    pub op1: Operand,
    pub op2: Operand,
    pub konst: Option<Konst>,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Ref(slot) => write!(f, "{slot:04}"),
            Operand::Lit(v) => write!(f, "{v}"),
            Operand::Cst(v) => write!(f, "{v}"),
            Operand::Index(v) => write!(f, "#{v}"),
            Operand::Flags(flags) => f.write_str(flags),
            Operand::Ctype { id, desc: Some(desc) } => write!(f, "ctype {id} ({desc})"),
            Operand::Ctype { id, desc: None } => write!(f, "ctype {id}"),
            Operand::None => Ok(()),
        }
    }
}

impl fmt::Display for Konst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Konst::Num(n) => write!(f, "{n}"),
            Konst::Int(i) => write!(f, "{i}"),
            Konst::Uint64(v) => write!(f, "0x{v:x}"),
            Konst::Ptr(p) => write!(f, "0x{p:x}"),
            Konst::Str(s) => write!(f, "\"{s}\""),
            Konst::Func { proto, name } => write!(f, "function {name} (0x{proto:x})"),
            Konst::Pri(t) => f.write_str(t),
        }
    }
}

impl fmt::Display for IrIns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04} {} {:>4} {:<6}",
            self.idx,
            if self.sunk { '>' } else { ' ' },
            self.ty.as_deref().unwrap_or(""),
            self.opcode,
        )?;
        for op in [&self.op1, &self.op2] {
            if *op != Operand::None {
                write!(f, " {op}")?;
            }
        }
        if let Some(konst) = &self.konst {
            write!(f, " {konst}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct RawIns {
    op1: u16,
    op2: u16,
    t: u8,
    o: u8,
    r: u8,
    s: u8,
    raw: u64,
}

impl RawIns {
    #[inline(always)]
    fn op12(&self) -> u32 {
        self.op1 as u32 | (self.op2 as u32) << 16
    }
}

fn raw_ins(ir: &[u8], slot: usize) -> Result<RawIns, Error> {
    let start = slot * 8;
    let bytes = ir
        .get(start..start + 8)
        .ok_or(Error::MalformedRecord("IR image shorter than its bounds"))?;
    let raw = u64::from_le_bytes(bytes.try_into().expect("sized"));
    Ok(RawIns {
        op1: raw as u16,
        op2: (raw >> 16) as u16,
        t: (raw >> 32) as u8,
        o: (raw >> 40) as u8,
        r: (raw >> 48) as u8,
        s: (raw >> 56) as u8,
        raw,
    })
}

pub(super) fn instructions(model: &AuditModel, trace: &Trace) -> Result<Vec<IrIns>, Error> {
    let tables = model
        .ir_tables
        .as_ref()
        .ok_or(Error::NoDebugInformation("IR decode tables"))?;

    let nk = (tables.ref_bias)
        .checked_sub(trace.nk as u64)
        .ok_or(Error::MalformedRecord("constant bound above the reference bias"))?
        as usize;
    let nins = (trace.nins as u64)
        .checked_sub(tables.ref_bias)
        .ok_or(Error::MalformedRecord("instruction bound below the reference bias"))?
        as usize;

    let mut out = vec![];
    let mut int_konsts: HashMap<usize, i32> = HashMap::new();

    // Constant pool. A 64-bit constant occupies two slots, the second one
    // holding its payload, so the walk consumes slot pairs where needed.
    let mut i = 0;
    while i < nk {
        let ins = raw_ins(&trace.ir, i)?;
        let opcode = op_name(model, tables, ins.o);
        let ty = type_name(model, tables, ins.t & 0x1f);

        let mut konst = None;
        let mut op1 = Operand::None;
        let mut op2 = Operand::None;
        let mut consumed = 1;

        if CONST64_OPS.contains(&opcode.as_str()) {
            if i + 1 >= nk {
                return Err(Error::MalformedRecord("64-bit constant missing its payload slot"));
            }
            let payload = raw_ins(&trace.ir, i + 1)?.raw;
            konst = Some(decode_konst(model, ty.as_deref(), payload)?);
            consumed = 2;
        } else {
            match opcode.as_str() {
                "kint" => {
                    let value = ins.op12() as i32;
                    int_konsts.insert(i, value);
                    konst = Some(Konst::Int(value));
                }
                "kpri" | "knull" => {
                    konst = Some(Konst::Pri(ty.clone().unwrap_or_else(|| "?".to_string())));
                }
                "kslot" => {
                    op1 = ref_operand(trace, ins.op1);
                    op2 = Operand::Lit(ins.op2);
                }
                _ => {}
            }
        }

        out.push(IrIns {
            idx: i,
            opcode,
            ty,
            reg: ins.r,
            slot: ins.s,
            sunk: is_sunk(ins.r, ins.s),
            op1,
            op2,
            konst,
        });
        i += consumed;
    }

    // Emitted instructions. The slot at the bias itself anchors the trace
    // and the final slot is the allocator's scratch, neither is rendered.
    let mut skip_payload = false;
    for i in 1..nins.saturating_sub(1) {
        if skip_payload {
            skip_payload = false;
            continue;
        }
        let slot = nk + i;
        let ins = raw_ins(&trace.ir, slot)?;
        if (ins.o as i64) >= tables.ir_max {
            continue;
        }
        let opcode = op_name(model, tables, ins.o);
        let ty = type_name(model, tables, ins.t & 0x1f);

        let (mode1, mode2) = operand_modes(model, tables, ins.o);
        let mut op1 = operand(trace, &mode1, ins.op1, ins.op12());
        let mut op2 = operand(trace, &mode2, ins.op2, ins.op12());
        let mut konst = None;

        if CONST64_OPS.contains(&opcode.as_str()) {
            let payload = raw_ins(&trace.ir, slot + 1)?.raw;
            konst = Some(decode_konst(model, ty.as_deref(), payload)?);
            skip_payload = true;
        }

        match opcode.as_str() {
            "sload" => op2 = Operand::Flags(render_flags(ins.op2, &SLOAD_FLAGS)),
            "xload" => op2 = Operand::Flags(render_flags(ins.op2, &XLOAD_FLAGS)),
            "conv" => op2 = Operand::Flags(conv_flags(model, tables, ins.op2)),
            "cnew" | "cnewi" => {
                if let Operand::Ref(slot) = op1 {
                    if let Some(id) = int_konsts.get(&slot) {
                        let id = *id as u32;
                        op1 = Operand::Ctype {
                            id,
                            desc: model.ctypes.get(&id).cloned(),
                        };
                    }
                }
            }
            op if INDEX_OPS.contains(&op) => op2 = Operand::Index(ins.op2),
            _ => {}
        }

        out.push(IrIns {
            idx: slot,
            opcode,
            ty,
            reg: ins.r,
            slot: ins.s,
            sunk: is_sunk(ins.r, ins.s),
            op1,
            op2,
            konst,
        });
    }

    Ok(out)
}

#[inline(always)]
fn is_sunk(reg: u8, slot: u8) -> bool {
    (reg == 253 || reg == 254) && (slot == 0 || slot == 255)
}

fn operand(trace: &Trace, mode: &str, value: u16, op12: u32) -> Operand {
    match mode {
        "ref" => ref_operand(trace, value),
        "lit" => Operand::Lit(value),
        "cst" => Operand::Cst(op12 as i32),
        _ => Operand::None,
    }
}

/// Translate a biased reference into the zero-based slot view. References
/// below the captured window render as plain literals.
fn ref_operand(trace: &Trace, value: u16) -> Operand {
    if (value as u32) >= trace.nk {
        Operand::Ref((value as u32 - trace.nk) as usize)
    } else {
        Operand::Lit(value)
    }
}

fn decode_konst(model: &AuditModel, ty: Option<&str>, payload: u64) -> Result<Konst, Error> {
    match ty {
        Some("num") => Ok(Konst::Num(f64::from_bits(payload))),
        Some("intp") => Ok(Konst::Uint64(payload)),
        Some("str") => model.interned_string(payload).map(Konst::Str),
        Some("func") => {
            let (proto, name) = model.function_proto(payload)?;
            Ok(Konst::Func { proto, name })
        }
        _ => Ok(Konst::Ptr(payload)),
    }
}

fn op_name(model: &AuditModel, tables: &IrTables, op: u8) -> String {
    model
        .dwarf()
        .enum_name(tables.irop, op as i64)
        .map(short_enum_name)
        .unwrap_or_else(|| op.to_string())
}

fn type_name(model: &AuditModel, tables: &IrTables, t: u8) -> Option<String> {
    model
        .dwarf()
        .enum_name(tables.irtype, t as i64)
        .map(short_enum_name)
}

fn operand_modes(model: &AuditModel, tables: &IrTables, op: u8) -> (String, String) {
    let mode = tables.mode.get(op as usize).copied().unwrap_or(0xff);
    (mode_name(model, tables, mode & 3), mode_name(model, tables, (mode >> 2) & 3))
}

fn mode_name(model: &AuditModel, tables: &IrTables, value: u8) -> String {
    model
        .dwarf()
        .enum_name(tables.irmode, value as i64)
        .map(short_enum_name)
        .unwrap_or_else(|| match value {
            0 => "ref".to_string(),
            1 => "lit".to_string(),
            2 => "cst".to_string(),
            _ => "none".to_string(),
        })
}

/// `IR_KGC` -> `kgc`, `IRT_NUM` -> `num`, `IRMref` -> `ref`.
fn short_enum_name(name: &str) -> String {
    let rest: String = match name.split_once('_') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => name.chars().skip_while(|c| c.is_ascii_uppercase()).collect(),
    };
    if rest.is_empty() {
        name.to_ascii_lowercase()
    } else {
        rest.to_ascii_lowercase()
    }
}

fn render_flags(value: u16, flags: &[(u16, char)]) -> String {
    flags
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|(_, c)| c)
        .collect()
}

fn conv_flags(model: &AuditModel, tables: &IrTables, value: u16) -> String {
    let src = type_name(model, tables, (value & 0x1f) as u8).unwrap_or_else(|| "?".to_string());
    if value & CONV_SEXT != 0 {
        format!("{src} sext")
    } else {
        src
    }
}

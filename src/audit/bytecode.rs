//! Decoder for the virtual machine's 32-bit bytecode instructions.
//!
//! An instruction packs `op(8)|a(8)|c(8)|b(8)` counted from the least
//! significant byte; operators without a B operand read the top 16 bits as
//! a single D operand instead. Which layout applies, what each operand
//! means, and the one-line description come from the schema table below.

/// Operand kind of one instruction slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Variable slot.
    Var,
    /// Destination slot.
    Dst,
    /// Base slot of a range.
    Base,
    /// Base slot, read-only.
    RBase,
    /// Upvalue index.
    Uv,
    /// Unsigned literal.
    Lit,
    /// Signed literal.
    Lits,
    /// Primitive value (0 = nil, 1 = false, 2 = true).
    Pri,
    /// Number constant index.
    Num,
    /// String constant index.
    Str,
    /// Template table index.
    Tab,
    /// Prototype index.
    Func,
    /// Cdata constant index.
    Cdata,
    /// Branch target, biased by 0x8000.
    Jump,
    /// Operand unused.
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct BcDef {
    pub name: &'static str,
    pub a: OperandKind,
    pub b: OperandKind,
    pub cd: OperandKind,
    pub hint: &'static str,
}

macro_rules! bcdef {
    ($(($name:ident, $a:ident, $b:ident, $cd:ident, $hint:expr)),* $(,)?) => {
        &[$(BcDef {
            name: stringify!($name),
            a: OperandKind::$a,
            b: OperandKind::$b,
            cd: OperandKind::$cd,
            hint: $hint,
        }),*]
    };
}

/// Per-opcode operand schema, in opcode-number order.
pub static BC_DEF: &[BcDef] = bcdef![
    // comparison ops
    (ISLT, Var, None, Var, "Jump if A < D"),
    (ISGE, Var, None, Var, "Jump if A >= D"),
    (ISLE, Var, None, Var, "Jump if A <= D"),
    (ISGT, Var, None, Var, "Jump if A > D"),
    (ISEQV, Var, None, Var, "Jump if A = D"),
    (ISNEV, Var, None, Var, "Jump if A ~= D"),
    (ISEQS, Var, None, Str, "Jump if A = D"),
    (ISNES, Var, None, Str, "Jump if A ~= D"),
    (ISEQN, Var, None, Num, "Jump if A = D"),
    (ISNEN, Var, None, Num, "Jump if A ~= D"),
    (ISEQP, Var, None, Pri, "Jump if A = D"),
    (ISNEP, Var, None, Pri, "Jump if A ~= D"),
    // unary test and copy ops
    (ISTC, Dst, None, Var, "Copy D to A and jump, if D is true"),
    (ISFC, Dst, None, Var, "Copy D to A and jump, if D is false"),
    (IST, None, None, Var, "Jump if D is true"),
    (ISF, None, None, Var, "Jump if D is false"),
    (ISTYPE, Var, None, Lit, "Assert that A has type D"),
    (ISNUM, Var, None, Lit, "Assert that A is a number"),
    // unary ops
    (MOV, Dst, None, Var, "Copy D to A"),
    (NOT, Dst, None, Var, "Set A to boolean not of D"),
    (UNM, Dst, None, Var, "Set A to -D"),
    (LEN, Dst, None, Var, "Set A to #D, object length of D"),
    // binary ops
    (ADDVN, Dst, Var, Num, "A = B + C"),
    (SUBVN, Dst, Var, Num, "A = B - C"),
    (MULVN, Dst, Var, Num, "A = B * C"),
    (DIVVN, Dst, Var, Num, "A = B / C"),
    (MODVN, Dst, Var, Num, "A = B % C"),
    (ADDNV, Dst, Var, Num, "A = C + B"),
    (SUBNV, Dst, Var, Num, "A = C - B"),
    (MULNV, Dst, Var, Num, "A = C * B"),
    (DIVNV, Dst, Var, Num, "A = C / B"),
    (MODNV, Dst, Var, Num, "A = C % B"),
    (ADDVV, Dst, Var, Var, "A = B + C"),
    (SUBVV, Dst, Var, Var, "A = B - C"),
    (MULVV, Dst, Var, Var, "A = B * C"),
    (DIVVV, Dst, Var, Var, "A = B / C"),
    (MODVV, Dst, Var, Var, "A = B % C"),
    (POW, Dst, Var, Var, "A = B ^ C"),
    (CAT, Dst, RBase, RBase, "A = B .. ~ .. C, concatenation of B to C"),
    // constant ops
    (KSTR, Dst, None, Str, "Set A to string constant D"),
    (KCDATA, Dst, None, Cdata, "Set A to cdata constant D"),
    (KSHORT, Dst, None, Lits, "Set A to 16 bit signed integer D"),
    (KNUM, Dst, None, Num, "Set A to number constant D"),
    (KPRI, Dst, None, Pri, "Set A to primitive D"),
    (KNIL, Base, None, Base, "Set slots A to D to nil"),
    // upvalue and function ops
    (UGET, Dst, None, Uv, "Set A to upvalue D"),
    (USETV, Uv, None, Var, "Set upvalue A to D"),
    (USETS, Uv, None, Str, "Set upvalue A to string constant D"),
    (USETN, Uv, None, Num, "Set upvalue A to number constant D"),
    (USETP, Uv, None, Pri, "Set upvalue A to primitive D"),
    (UCLO, RBase, None, Jump, "Close upvalues for slots >= A and jump to D"),
    (FNEW, Dst, None, Func, "Create new closure from prototype D and store it in A"),
    // table ops
    (TNEW, Dst, None, Lit, "Set A to new table with size D"),
    (TDUP, Dst, None, Tab, "Set A to duplicated template table D"),
    (GGET, Dst, None, Str, "A = _G[D]"),
    (GSET, Var, None, Str, "_G[D] = A"),
    (TGETV, Dst, Var, Var, "A = B[C]"),
    (TGETS, Dst, Var, Str, "A = B[C]"),
    (TGETB, Dst, Var, Lit, "A = B[C]"),
    (TGETR, Dst, Var, Var, "A = B[C], raw access"),
    (TSETV, Var, Var, Var, "B[C] = A"),
    (TSETS, Var, Var, Str, "B[C] = A"),
    (TSETB, Var, Var, Lit, "B[C] = A"),
    (TSETM, Base, None, Num, "(A-1)[D], (A-1)[D+1], ... = A, A+1, ..."),
    (TSETR, Var, Var, Var, "B[C] = A, raw access"),
    // calls and vararg handling
    (CALLM, Base, Lit, Lit, "Call: A, ..., A+B-2 = A(A+1, ..., A+C+MULTRES)"),
    (CALL, Base, Lit, Lit, "Call: A, ..., A+B-2 = A(A+1, ..., A+C-1)"),
    (CALLMT, Base, None, Lit, "Tailcall: return A(A+1, ..., A+D+MULTRES)"),
    (CALLT, Base, None, Lit, "Tailcall: return A(A+1, ..., A+D-1)"),
    (ITERC, Base, Lit, Lit, "Call iterator: A, A+1, A+2 = A-3, A-2, A-1; A, ..., A+B-2 = A(A+1, A+2)"),
    (ITERN, Base, Lit, Lit, "Specialized ITERC, if iterator function A-3 is next()"),
    (VARG, Base, Lit, Lit, "Vararg: A, ..., A+B-2 = ..."),
    (ISNEXT, Base, None, Jump, "Verify ITERN specialization and jump"),
    // returns
    (RETM, Base, None, Lit, "Return A, ..., A+D+MULTRES-1"),
    (RET, RBase, None, Lit, "Return A, ..., A+D-2"),
    (RET0, RBase, None, Lit, "Return no results"),
    (RET1, RBase, None, Lit, "Return A"),
    // loops and branches
    (FORI, Base, None, Jump, "Numeric 'for' loop init"),
    (JFORI, Base, None, Jump, "Numeric 'for' loop init, JIT-compiled"),
    (FORL, Base, None, Jump, "Numeric 'for' loop"),
    (IFORL, Base, None, Jump, "Numeric 'for' loop, force interpreter"),
    (JFORL, Base, None, Lit, "Numeric 'for' loop, JIT-compiled"),
    (ITERL, Base, None, Jump, "Iterator 'for' loop"),
    (IITERL, Base, None, Jump, "Iterator 'for' loop, force interpreter"),
    (JITERL, Base, None, Lit, "Iterator 'for' loop, JIT-compiled"),
    (LOOP, RBase, None, Jump, "Generic loop"),
    (ILOOP, RBase, None, Jump, "Generic loop, force interpreter"),
    (JLOOP, RBase, None, Lit, "Generic loop, JIT-compiled"),
    (JMP, RBase, None, Jump, "Jump"),
    // function headers
    (FUNCF, RBase, None, None, "Fixed-arg Lua function"),
    (IFUNCF, RBase, None, None, "Fixed-arg Lua function, force interpreter"),
    (JFUNCF, RBase, None, Lit, "Fixed-arg Lua function, JIT-compiled"),
    (FUNCV, RBase, None, None, "Vararg Lua function"),
    (IFUNCV, RBase, None, None, "Vararg Lua function, force interpreter"),
    (JFUNCV, RBase, None, Lit, "Vararg Lua function, JIT-compiled"),
    (FUNCC, RBase, None, None, "Pseudo-header for C functions"),
    (FUNCCW, RBase, None, None, "Pseudo-header for wrapped C functions"),
];

const PRIMITIVES: [&str; 3] = ["nil", "false", "true"];

const JUMP_BIAS: i32 = 0x8000;

/// One decoded instruction. All raw operand fields are kept; `j`, `ds` and
/// `pri` carry the decoded D operand when the schema calls for a jump
/// offset, a signed literal or a primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub op: String,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u16,
    pub j: Option<i32>,
    pub ds: Option<i16>,
    pub pri: Option<&'static str>,
    pub hint: String,
}

impl std::fmt::Display for Bytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<6} {:3}", self.op, self.a)?;
        if let Some(j) = self.j {
            write!(f, " => {j:+}")?;
        } else if let Some(ds) = self.ds {
            write!(f, " {ds}")?;
        } else if let Some(pri) = self.pri {
            write!(f, " {pri}")?;
        } else {
            write!(f, " {:3} {:3}", self.b, self.c)?;
        }
        write!(f, "  ; {}", self.hint)
    }
}

#[inline(always)]
pub fn def(op: u8) -> Option<&'static BcDef> {
    BC_DEF.get(op as usize)
}

pub fn decode(word: u32) -> Bytecode {
    let op = (word & 0xff) as u8;
    let a = ((word >> 8) & 0xff) as u8;
    let c = ((word >> 16) & 0xff) as u8;
    let b = (word >> 24) as u8;
    let d = (word >> 16) as u16;

    match def(op) {
        Some(def) => Bytecode {
            op: def.name.to_string(),
            a,
            b,
            c,
            d,
            j: (def.cd == OperandKind::Jump).then(|| d as i32 - JUMP_BIAS),
            ds: (def.cd == OperandKind::Lits).then_some(d as i16),
            pri: (def.cd == OperandKind::Pri)
                .then(|| PRIMITIVES.get(d as usize).copied().unwrap_or("?")),
            hint: def.hint.to_string(),
        },
        None => Bytecode {
            op: op.to_string(),
            a,
            b,
            c,
            d,
            j: None,
            ds: None,
            pri: None,
            hint: "Unknown bytecode".to_string(),
        },
    }
}

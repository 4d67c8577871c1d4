use crate::audit::bytecode::{self, Bytecode};
use crate::audit::error::Error;
use crate::audit::ir::{self, IrIns};
use crate::audit::{AuditModel, Event, EventPayload};
use bytes::Bytes;
use once_cell::sync::OnceCell;

/// One position of the bytecode log: the prototype executing at the time,
/// the bytecode position inside it, and the frame depth relative to the
/// frame the recording started in (returns below it go negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcLogEntry {
    pub pt: u64,
    pub pos: u32,
    pub framedepth: i64,
}

/// Source location summary of one bytecode-log position. Positions whose
/// prototype never reached the prototype table render as `'?'`.
#[derive(Debug, Clone, PartialEq)]
pub struct LineInfo {
    pub framedepth: i64,
    pub chunkname: String,
    pub chunkline: u32,
    pub declname: String,
    pub declline: u32,
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:+} {}:{} in {}:{}",
            self.framedepth, self.chunkname, self.chunkline, self.declname, self.declline
        )
    }
}

/// A successfully compiled trace.
#[derive(Debug)]
pub struct Trace {
    pub traceno: u32,
    pub parent: u32,
    pub startpc: u64,
    pub address: u64,
    /// Biased instruction bounds of the IR: constants live below
    /// `REF_BIAS`, emitted instructions above.
    pub nins: u32,
    pub nk: u32,
    /// Captured IR image, starting at biased slot `nk`.
    pub ir: Bytes,
    pub mcode: u64,
    pub szmcode: u64,
    pub snap: u64,
    pub nsnap: u32,
    pub snapmap: u64,
    pub nsnapmap: u32,
    pub szirmcode: u64,
    pub bclog: Vec<BcLogEntry>,
    /// Index of the `trace_stop` event this trace was created by.
    pub stop_event: usize,
    pub(super) children: OnceCell<Vec<u32>>,
}

impl Trace {
    /// Identity of the entry point: aborts and stops that began at the same
    /// (parent, start-PC) pair share a start id.
    #[inline(always)]
    pub fn start_id(&self) -> String {
        start_id(self.parent, self.startpc)
    }

    /// Parent trace, `None` for a root trace.
    pub fn parent_trace<'m>(&self, model: &'m AuditModel) -> Option<&'m Trace> {
        (self.parent != 0)
            .then(|| model.traces.get(&self.parent))
            .flatten()
    }

    /// Trace numbers of the side traces rooted in this trace, in
    /// trace-table iteration order. Computed once on first call.
    pub fn children<'m>(&'m self, model: &'m AuditModel) -> &'m [u32] {
        self.children.get_or_init(|| {
            model
                .traces
                .values()
                .filter(|t| t.parent == self.traceno)
                .map(|t| t.traceno)
                .collect()
        })
    }

    /// The `trace_stop` event that created this trace, followed by every
    /// `trace_abort` sharing its start id, in log order.
    pub fn events<'m>(&self, model: &'m AuditModel) -> Vec<&'m Event> {
        let sid = self.start_id();
        let mut events = vec![&model.events[self.stop_event]];
        events.extend(model.events.iter().filter(|e| match e.payload {
            EventPayload::TraceAbort { abort } => model.aborts[abort].start_id() == sid,
            _ => false,
        }));
        events
    }

    /// Source location of the bytecode-log entry at `bcpos`.
    pub fn lineinfo(&self, model: &AuditModel, bcpos: usize) -> Option<LineInfo> {
        self.bclog.get(bcpos).map(|entry| model.lineinfo(entry))
    }

    /// Frame-transition summary: one entry per change of frame depth,
    /// skipping frames whose prototype is unknown.
    pub fn contour(&self, model: &AuditModel) -> Vec<LineInfo> {
        let mut contour: Vec<LineInfo> = vec![];
        let mut last_depth = None;
        for entry in &self.bclog {
            let li = model.lineinfo(entry);
            if li.declname != "?" && last_depth != Some(li.framedepth) {
                last_depth = Some(li.framedepth);
                contour.push(li);
            }
        }
        contour
    }

    /// Decoded bytecode per logged position; `None` where the prototype is
    /// unknown.
    pub fn bytecodes(&self, model: &AuditModel) -> Vec<Option<Bytecode>> {
        self.bclog
            .iter()
            .map(|entry| {
                model
                    .prototypes
                    .get(&entry.pt)
                    .and_then(|proto| proto.bc(entry.pos))
                    .map(bytecode::decode)
            })
            .collect()
    }

    /// Reassembled IR instruction stream, constants first.
    pub fn instructions(&self, model: &AuditModel) -> Result<Vec<IrIns>, Error> {
        ir::instructions(model, self)
    }
}

/// A failed compilation attempt. Shares the bytecode-log contract of
/// [`Trace`] but never enters the trace table.
#[derive(Debug)]
pub struct TraceAbort {
    /// Symbolic abort reason, resolved from the runtime's error enumeration.
    pub error: String,
    pub parent: u32,
    pub startpc: u64,
    pub bclog: Vec<BcLogEntry>,
    /// Index of the `trace_abort` event.
    pub event: usize,
}

impl TraceAbort {
    #[inline(always)]
    pub fn start_id(&self) -> String {
        start_id(self.parent, self.startpc)
    }
}

fn start_id(parent: u32, startpc: u64) -> String {
    format!("{parent}/{startpc:x}")
}

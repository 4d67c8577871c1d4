//! The audit-log analyzer.
//!
//! An audit log is a stream of msgpack records: raw memory images of the
//! runtime's internal structures, blobs (one of which is the embedded
//! split-DWARF object describing every structure layout), and events. The
//! model replays the stream twice: pass A decodes the records and brings
//! up the debug information, pass B builds the memory map and the
//! event/prototype/trace graph on top of it.

pub mod bytecode;
pub mod dwarf;
pub mod error;
pub mod ir;
pub mod memory;
pub mod msgpack;
pub mod proto;
pub mod trace;

use crate::audit::dwarf::descriptor::{Descriptor, TypeId};
use crate::audit::dwarf::DwarfLoader;
use crate::audit::error::Error;
use crate::audit::ir::IrTables;
use crate::audit::memory::{MemoryImage, MemoryMap, View};
use crate::audit::msgpack::{MsgpackReader, Value};
use crate::audit::proto::Prototype;
use crate::audit::trace::{BcLogEntry, LineInfo, Trace, TraceAbort};
use crate::vmprofile::{VmProfile, DEFAULT_TRACE_MAX, DEFAULT_VMST_MAX};
use bytes::Bytes;
use indexmap::IndexMap;
use log::{debug, warn};
use memmap2::Mmap;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the blob record carrying the embedded debug information.
pub const DWARF_BLOB_NAME: &str = "lj_dwarf.dwo";

/// One entry of the event timeline. Events are totally ordered; the vector
/// index doubles as the predecessor link.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub idx: usize,
    /// Monotonic time of the event, in nanoseconds.
    pub nanotime: u64,
    pub name: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    NewPrototype { address: u64 },
    NewCtype { id: u32 },
    TraceStop { traceno: u32 },
    TraceAbort { abort: usize },
    Lex,
    Other,
}

impl Event {
    /// The predecessor event.
    pub fn prev<'m>(&self, model: &'m AuditModel) -> Option<&'m Event> {
        self.idx.checked_sub(1).map(|idx| &model.events[idx])
    }

    /// Nanoseconds elapsed since the predecessor event.
    pub fn nanodelta(&self, model: &AuditModel) -> u64 {
        match self.prev(model) {
            Some(prev) => self.nanotime.saturating_sub(prev.nanotime),
            None => 0,
        }
    }

    /// Seconds elapsed since the first event of the log.
    pub fn reltime(&self, model: &AuditModel) -> f64 {
        match model.events.first() {
            Some(first) => self.nanotime.saturating_sub(first.nanotime) as f64 / 1e9,
            None => 0.0,
        }
    }
}

/// A VM profile file attached to the model, stamped with its capture time
/// (seconds since the Unix epoch).
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    pub timestamp: f64,
    pub profile: VmProfile,
}

/// Load an audit log from disk.
pub fn load_auditlog(path: impl AsRef<Path>) -> Result<AuditModel, Error> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    AuditModel::from_bytes(&mmap)
}

/// The reconstructed model of one audit log. Everything except the
/// memoization caches and the attached profile series is frozen after
/// load; queries are pure.
pub struct AuditModel {
    dwarf: DwarfLoader,
    pub memory: MemoryMap,
    pub events: Vec<Event>,
    pub traces: BTreeMap<u32, Trace>,
    pub prototypes: HashMap<u64, Prototype>,
    pub ctypes: IndexMap<u32, String>,
    pub aborts: Vec<TraceAbort>,
    pub profiles: IndexMap<String, Vec<ProfileSnapshot>>,
    pub(crate) ir_tables: Option<IrTables>,
    ir_mode: Option<Bytes>,
    trace_error: Option<TypeId>,
    gcproto_size: Option<u64>,
}

impl AuditModel {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        // Pass A: framing and DWARF bring-up.
        let mut records = vec![];
        let mut reader = MsgpackReader::new(buf);
        while let Some(value) = reader.read()? {
            records.push(parse_record(value)?);
        }

        let dwarf_blob = records
            .iter()
            .find_map(|record| match record {
                Record::Blob { name, data } if name == DWARF_BLOB_NAME => Some(data.clone()),
                _ => None,
            })
            .ok_or(Error::NoDebugInformation("embedded lj_dwarf.dwo blob"))?;
        let mut dwarf = DwarfLoader::from_elf(&dwarf_blob)?;

        let gcproto_size = dwarf
            .descriptor_of_name("GCproto")
            .ok()
            .map(|id| dwarf.graph().size_of(id));
        let trace_error = dwarf.descriptor_of_name("TraceError").ok();

        let mut model = AuditModel {
            dwarf,
            memory: MemoryMap::new(),
            events: vec![],
            traces: BTreeMap::new(),
            prototypes: HashMap::new(),
            ctypes: IndexMap::new(),
            aborts: vec![],
            profiles: IndexMap::new(),
            ir_tables: None,
            ir_mode: None,
            trace_error,
            gcproto_size,
        };

        // Pass B: replay the records into the model.
        for record in records {
            match record {
                Record::Blob { .. } => {}
                Record::Memory {
                    address,
                    hint,
                    data,
                } => model.bind_memory(address, hint, data)?,
                Record::Event { map } => model.dispatch_event(map)?,
            }
        }

        model.ir_tables = model.build_ir_tables();
        Ok(model)
    }

    #[inline(always)]
    pub fn dwarf(&self) -> &DwarfLoader {
        &self.dwarf
    }

    // ------------------------------- pass B handlers ---------------------------------------------

    fn bind_memory(&mut self, address: u64, hint: String, data: Bytes) -> Result<(), Error> {
        let ident = hint_identifier(&hint).to_string();
        let die = self
            .dwarf
            .find_die(&ident)
            .ok_or_else(|| Error::DieNotFound(ident.clone()))?;

        // A variable's descriptor already is a pointer to the imaged data;
        // a plain type gets wrapped into one.
        let type_id = if self.dwarf.die_tag(die)? == gimli::DW_TAG_variable {
            self.dwarf.descriptor_of(die)?
        } else {
            let pointee = self.dwarf.descriptor_of(die)?;
            self.dwarf.graph_mut().push(Descriptor::Pointer {
                target: Some(pointee),
            })
        };

        if ident == "lj_ir_mode" {
            self.ir_mode = Some(data.clone());
        }
        self.memory.insert(MemoryImage {
            address,
            hint,
            type_id,
            data,
        });
        Ok(())
    }

    fn dispatch_event(&mut self, map: Value) -> Result<(), Error> {
        let name = map
            .get("event")
            .and_then(Value::as_str)
            .ok_or(Error::MalformedRecord("event record without a name"))?
            .to_string();
        let nanotime = map
            .get("nanotime")
            .and_then(Value::as_u64)
            .ok_or(Error::MalformedRecord("event record without a nanotime"))?;
        let idx = self.events.len();

        let payload = match name.as_str() {
            "new_prototype" => {
                let address = event_field(&map, "GCproto")?;
                self.add_prototype(address)?;
                EventPayload::NewPrototype { address }
            }
            "new_ctypeid" => {
                let id = narrow_u32(event_field(&map, "id")?)?;
                let desc = map
                    .get("desc")
                    .and_then(Value::as_str)
                    .ok_or(Error::MalformedRecord("new_ctypeid record without a desc"))?
                    .to_string();
                self.ctypes.insert(id, desc);
                EventPayload::NewCtype { id }
            }
            "trace_stop" => {
                let traceno = self.add_trace(&map, idx)?;
                EventPayload::TraceStop { traceno }
            }
            "trace_abort" => {
                let abort = self.add_abort(&map, idx)?;
                EventPayload::TraceAbort { abort }
            }
            "lex" => EventPayload::Lex,
            other => {
                debug!(target: "audit", "unhandled event kind `{other}`");
                EventPayload::Other
            }
        };

        self.events.push(Event {
            idx,
            nanotime,
            name,
            payload,
        });
        Ok(())
    }

    fn add_prototype(&mut self, address: u64) -> Result<(), Error> {
        let proto = {
            let view = self.memory.view(self.dwarf.graph(), address)?;
            let data = self
                .memory
                .get(address)
                .ok_or(Error::MissingMemory(address))?
                .data
                .clone();
            let chunkname = match view
                .field_u64("chunkname")
                .ok()
                .and_then(|addr| self.interned_string(addr).ok())
            {
                Some(name) => name,
                None => {
                    warn!(target: "audit", "prototype 0x{address:x} has no resolvable chunk name");
                    "?".to_string()
                }
            };
            Prototype::reconstruct(view, &data, chunkname)?
        };
        self.prototypes.insert(address, proto);
        Ok(())
    }

    fn add_trace(&mut self, map: &Value, event_idx: usize) -> Result<u32, Error> {
        let trace_addr = event_field(map, "GCtrace")?;
        let jit_addr = event_field(map, "jit_State")?;

        let view = self.memory.view(self.dwarf.graph(), trace_addr)?;
        let traceno = narrow_u32(view.field_u64("traceno")?)?;
        let nins = narrow_u32(view.field_u64("nins")?)?;
        let nk = narrow_u32(view.field_u64("nk")?)?;
        let ir_ptr = view.field_u64("ir")?;
        let mcode = view.field_u64("mcode")?;
        let szmcode = view.field_u64("szmcode")?;
        let snap = view.field_u64("snap")?;
        let nsnap = view.field_u64("nsnap")? as u32;
        let snapmap = view.field_u64("snapmap")?;
        let nsnapmap = view.field_u64("nsnapmap")? as u32;
        let szirmcode = view.field_u64("szirmcode").unwrap_or(0);

        // The IR is logged starting at its lowest constant: ir + nk,
        // base-biased pointer arithmetic on 8-byte instruction slots.
        let ir_addr = ir_ptr + nk as u64 * 8;
        let ir = self
            .memory
            .get(ir_addr)
            .ok_or(Error::MissingMemory(ir_addr))?
            .data
            .clone();
        for addr in [mcode, snap, snapmap, szirmcode] {
            if addr != 0 && !self.memory.contains(addr) {
                return Err(Error::MissingMemory(addr));
            }
        }

        let (parent, startpc, bclog) = self.jit_state(jit_addr)?;
        self.traces.insert(
            traceno,
            Trace {
                traceno,
                parent,
                startpc,
                address: trace_addr,
                nins,
                nk,
                ir,
                mcode,
                szmcode,
                snap,
                nsnap,
                snapmap,
                nsnapmap,
                szirmcode,
                bclog,
                stop_event: event_idx,
                children: OnceCell::new(),
            },
        );
        Ok(traceno)
    }

    fn add_abort(&mut self, map: &Value, event_idx: usize) -> Result<usize, Error> {
        let jit_addr = event_field(map, "jit_State")?;
        let (parent, startpc, bclog) = self.jit_state(jit_addr)?;

        let code = event_field(map, "TraceError")?;
        let error = self
            .trace_error
            .and_then(|id| self.dwarf.enum_name(id, code as i64))
            .map(str::to_string)
            .unwrap_or_else(|| code.to_string());

        let idx = self.aborts.len();
        self.aborts.push(TraceAbort {
            error,
            parent,
            startpc,
            bclog,
            event: event_idx,
        });
        Ok(idx)
    }

    /// Read the recording state out of a captured `jit_State`: parent trace
    /// number, start PC and the decoded bytecode log.
    fn jit_state(&self, address: u64) -> Result<(u32, u64, Vec<BcLogEntry>), Error> {
        let graph = self.dwarf.graph();
        let view = self.memory.view(graph, address)?;
        let parent = narrow_u32(view.field_u64("parent")?)?;
        let startpc = view.field_u64("startpc")?;
        let bclog_ptr = view.field_u64("bclog")?;
        let nbclog = view.field_u64("nbclog")? as usize;

        let mut entries = Vec::with_capacity(nbclog);
        if nbclog > 0 {
            let image = self
                .memory
                .get(bclog_ptr)
                .ok_or(Error::MissingMemory(bclog_ptr))?;
            let entry_view = self.memory.view(graph, bclog_ptr)?;
            let entry_type = entry_view.type_id;
            let entry_size = entry_view.byte_size() as usize;
            for i in 0..nbclog {
                let start = i * entry_size;
                let data = image
                    .data
                    .get(start..start + entry_size)
                    .ok_or(Error::ShortImage(bclog_ptr))?;
                let entry = View::new(graph, bclog_ptr + start as u64, entry_type, data);
                entries.push(BcLogEntry {
                    pt: entry.field_u64("pt")?,
                    pos: entry.field_u64("pos")? as u32,
                    framedepth: entry.field_i64("framedepth")?,
                });
            }
        }
        Ok((parent, startpc, entries))
    }

    fn build_ir_tables(&mut self) -> Option<IrTables> {
        let mode = self.ir_mode.clone()?;
        let irop = self.dwarf.descriptor_of_name("IROp").ok()?;
        let irtype = self.dwarf.descriptor_of_name("IRType").ok()?;
        let irmode = self.dwarf.descriptor_of_name("IRMode").ok()?;
        let ir_max = self.dwarf.constant("IR__MAX")?;
        let ref_bias = self.dwarf.constant("REF_BIAS")? as u64;
        Some(IrTables {
            irop,
            irtype,
            irmode,
            ir_max,
            ref_bias,
            mode,
        })
    }

    // ------------------------------- shared lookups ----------------------------------------------

    /// Source location of one bytecode-log entry. An unknown prototype is a
    /// tolerated gap and renders as `'?'`.
    pub fn lineinfo(&self, entry: &BcLogEntry) -> LineInfo {
        match self.prototypes.get(&entry.pt) {
            Some(proto) => LineInfo {
                framedepth: entry.framedepth,
                chunkname: proto.chunkname.clone(),
                chunkline: proto.line(entry.pos),
                declname: proto.declname.clone(),
                declline: proto.firstline,
            },
            None => LineInfo {
                framedepth: entry.framedepth,
                chunkname: "?".to_string(),
                chunkline: 0,
                declname: "?".to_string(),
                declline: 0,
            },
        }
    }

    /// Content of the interned string object at `address`. The character
    /// payload sits behind the string header in the same image.
    pub fn interned_string(&self, address: u64) -> Result<String, Error> {
        let view = self.memory.view(self.dwarf.graph(), address)?;
        let len = view.field_u64("len")? as usize;
        let header = view.byte_size() as usize;
        let image = self
            .memory
            .get(address)
            .ok_or(Error::MissingMemory(address))?;
        let bytes = image
            .data
            .get(header..header + len)
            .ok_or(Error::ShortImage(address))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Resolve a function object to its prototype: the function's bytecode
    /// pointer sits `sizeof(GCproto)` behind the prototype address.
    pub fn function_proto(&self, address: u64) -> Result<(u64, String), Error> {
        let view = self.memory.view(self.dwarf.graph(), address)?;
        let pc = view
            .field("pc")
            .or_else(|_| view.field("l")?.field("pc"))?
            .scalar()?;
        let header = self
            .gcproto_size
            .ok_or(Error::NoDebugInformation("GCproto"))?;
        let proto = pc
            .checked_sub(header)
            .ok_or(Error::MalformedRecord("function bytecode pointer below its prototype"))?;
        let name = self
            .prototypes
            .get(&proto)
            .map(|p| p.declname.clone())
            .unwrap_or_else(|| "?".to_string());
        Ok((proto, name))
    }

    // ------------------------------- vm profiles -------------------------------------------------

    /// Append a profile snapshot. The series name is the file stem;
    /// timestamps must be non-decreasing per name and default to now.
    pub fn add_profile(
        &mut self,
        path: impl AsRef<Path>,
        timestamp: Option<f64>,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        let (trace_max, vmst_max) = self.profile_shape();
        let profile = VmProfile::load_with_shape(path, trace_max, vmst_max)?;

        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("profile")
            .to_string();
        let timestamp = timestamp.unwrap_or_else(now_secs);

        let series = self.profiles.entry(name.clone()).or_default();
        if let Some(last) = series.last() {
            if timestamp < last.timestamp {
                return Err(Error::ProfileOrder(name));
            }
        }
        series.push(ProfileSnapshot { timestamp, profile });
        Ok(())
    }

    /// Select one profile per series for the given time window. Negative
    /// times are relative: endtime to now, starttime to the window end.
    /// A window spanning two or more snapshots yields the delta of its
    /// first and last; a single snapshot is returned as-is.
    pub fn select_profiles(
        &self,
        starttime: Option<f64>,
        endtime: Option<f64>,
    ) -> Result<IndexMap<String, VmProfile>, Error> {
        let now = now_secs();
        let end = match endtime {
            None => now,
            Some(e) if e < 0.0 => now + e,
            Some(e) => e,
        };
        let start = match starttime {
            None => f64::NEG_INFINITY,
            Some(s) if s < 0.0 => end + s,
            Some(s) => s,
        };

        let mut selected = IndexMap::new();
        for (name, series) in &self.profiles {
            let window: Vec<&ProfileSnapshot> = series
                .iter()
                .filter(|s| s.timestamp >= start && s.timestamp <= end)
                .collect();
            match window.as_slice() {
                [] => {}
                [only] => {
                    selected.insert(name.clone(), only.profile.clone());
                }
                [first, .., last] => {
                    selected.insert(name.clone(), first.profile.delta(&last.profile)?);
                }
            }
        }
        Ok(selected)
    }

    fn profile_shape(&self) -> (usize, usize) {
        let trace_max = self
            .dwarf
            .constant("LJ_VMPROFILE_TRACE_MAX")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_TRACE_MAX);
        let vmst_max = self
            .dwarf
            .constant("LJ_VMST__MAX")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_VMST_MAX);
        (trace_max, vmst_max)
    }
}

enum Record {
    Memory { address: u64, hint: String, data: Bytes },
    Blob { name: String, data: Bytes },
    Event { map: Value },
}

fn parse_record(value: Value) -> Result<Record, Error> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedRecord("record without a type"))?;
    match kind {
        "memory" => Ok(Record::Memory {
            address: value
                .get("address")
                .and_then(Value::as_u64)
                .ok_or(Error::MalformedRecord("memory record without an address"))?,
            hint: value
                .get("hint")
                .and_then(Value::as_str)
                .ok_or(Error::MalformedRecord("memory record without a hint"))?
                .to_string(),
            data: value
                .get("data")
                .and_then(Value::as_bin)
                .ok_or(Error::MalformedRecord("memory record without data"))?
                .clone(),
        }),
        "blob" => Ok(Record::Blob {
            name: value
                .get("name")
                .and_then(Value::as_str)
                .ok_or(Error::MalformedRecord("blob record without a name"))?
                .to_string(),
            data: value
                .get("data")
                .and_then(Value::as_bin)
                .ok_or(Error::MalformedRecord("blob record without data"))?
                .clone(),
        }),
        "event" => Ok(Record::Event { map: value }),
        _ => Err(Error::MalformedRecord("unknown record type")),
    }
}

/// Extract the contiguous identifier out of a memory hint.
fn hint_identifier(hint: &str) -> &str {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let start = hint.find(is_ident).unwrap_or(hint.len());
    let rest = &hint[start..];
    let end = rest.find(|c: char| !is_ident(c)).unwrap_or(rest.len());
    &rest[..end]
}

fn event_field(map: &Value, key: &'static str) -> Result<u64, Error> {
    map.get(key)
        .and_then(Value::as_u64)
        .ok_or(Error::MalformedRecord(key))
}

fn narrow_u32(value: u64) -> Result<u32, Error> {
    let narrowed = value as u32;
    if narrowed as u64 != value {
        return Err(Error::Narrow(value, "u32"));
    }
    Ok(narrowed)
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

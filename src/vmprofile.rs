//! Sampled VM profiles: a counter grid indexed by (trace, VM state).

use crate::audit::error::Error;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::fs;
use std::path::Path;

pub const VMPROFILE_MAGIC: u32 = 0x1d50_f007;
pub const VMPROFILE_MAJOR: u16 = 4;

/// Grid defaults, used when no debug information supplies the dimensions.
pub const DEFAULT_TRACE_MAX: usize = 4096;
pub const DEFAULT_VMST_MAX: usize = 11;

const HEADER_SIZE: usize = 8;

/// The fixed, index-keyed set of sampled VM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum VmState {
    Interp,
    C,
    Igc,
    Exit,
    Record,
    Opt,
    Asm,
    Head,
    Loop,
    Jgc,
    Ffi,
}

impl VmState {
    pub const ALL: [VmState; DEFAULT_VMST_MAX] = [
        VmState::Interp,
        VmState::C,
        VmState::Igc,
        VmState::Exit,
        VmState::Record,
        VmState::Opt,
        VmState::Asm,
        VmState::Head,
        VmState::Loop,
        VmState::Jgc,
        VmState::Ffi,
    ];

    #[inline(always)]
    pub fn from_index(index: usize) -> Option<VmState> {
        Self::ALL.get(index).copied()
    }
}

fn state_name(index: usize) -> String {
    match VmState::from_index(index) {
        Some(state) => state.to_string(),
        None => index.to_string(),
    }
}

/// One entry of the hot-trace ranking. `traceno` is `None` for row zero,
/// the untraced catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotTrace {
    pub traceno: Option<u32>,
    pub vmst: IndexMap<String, u64>,
    pub total: u64,
}

/// A parsed VM profile blob. Counters are little-endian u64, laid out as
/// `count[traceno * vmst_max + vmst]` behind an 8-byte header.
#[derive(Debug, Clone)]
pub struct VmProfile {
    pub major: u16,
    pub minor: u16,
    trace_max: usize,
    vmst_max: usize,
    counts: Vec<u64>,
    total: OnceCell<u64>,
    vmst_totals: OnceCell<IndexMap<String, u64>>,
    hot: OnceCell<Vec<HotTrace>>,
}

impl VmProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::load_with_shape(path, DEFAULT_TRACE_MAX, DEFAULT_VMST_MAX)
    }

    pub fn load_with_shape(
        path: impl AsRef<Path>,
        trace_max: usize,
        vmst_max: usize,
    ) -> Result<Self, Error> {
        let data = fs::read(path)?;
        Self::from_bytes(&data, trace_max, vmst_max)
    }

    pub fn from_bytes(data: &[u8], trace_max: usize, vmst_max: usize) -> Result<Self, Error> {
        let expected = HEADER_SIZE + trace_max * vmst_max * 8;
        if data.len() < HEADER_SIZE {
            return Err(Error::ProfileTruncated {
                expected,
                actual: data.len(),
            });
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().expect("sized"));
        if magic != VMPROFILE_MAGIC {
            return Err(Error::ProfileMagic(magic));
        }
        let major = u16::from_le_bytes(data[4..6].try_into().expect("sized"));
        let minor = u16::from_le_bytes(data[6..8].try_into().expect("sized"));
        if major != VMPROFILE_MAJOR {
            return Err(Error::ProfileVersion(major, minor));
        }
        if data.len() < expected {
            return Err(Error::ProfileTruncated {
                expected,
                actual: data.len(),
            });
        }

        let counts = data[HEADER_SIZE..expected]
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes(w.try_into().expect("chunked")))
            .collect();
        Ok(Self {
            major,
            minor,
            trace_max,
            vmst_max,
            counts,
            total: OnceCell::new(),
            vmst_totals: OnceCell::new(),
            hot: OnceCell::new(),
        })
    }

    /// Write the raw blob back out.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.counts.len() * 8);
        out.extend_from_slice(&VMPROFILE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.major.to_le_bytes());
        out.extend_from_slice(&self.minor.to_le_bytes());
        for count in &self.counts {
            out.extend_from_slice(&count.to_le_bytes());
        }
        fs::write(path, out)?;
        Ok(())
    }

    #[inline(always)]
    pub fn trace_max(&self) -> usize {
        self.trace_max
    }

    #[inline(always)]
    pub fn vmst_max(&self) -> usize {
        self.vmst_max
    }

    /// Sample count for one (trace, VM state) cell; zero outside the grid.
    pub fn count(&self, traceno: usize, vmst: usize) -> u64 {
        if vmst >= self.vmst_max {
            return 0;
        }
        self.counts
            .get(traceno * self.vmst_max + vmst)
            .copied()
            .unwrap_or(0)
    }

    /// Sum over every cell of the grid.
    pub fn total_samples(&self) -> u64 {
        *self
            .total
            .get_or_init(|| self.counts.iter().copied().sum())
    }

    /// Per-VM-state totals, in state-index order.
    pub fn total_vmst_samples(&self) -> &IndexMap<String, u64> {
        self.vmst_totals.get_or_init(|| {
            let mut totals = IndexMap::new();
            for vmst in 0..self.vmst_max {
                let sum = (0..self.trace_max).map(|t| self.count(t, vmst)).sum();
                totals.insert(state_name(vmst), sum);
            }
            totals
        })
    }

    /// Traces ranked by total sample count, descending; ties keep grid
    /// order; rows without samples are dropped. Computed once.
    pub fn hot_traces(&self) -> &[HotTrace] {
        self.hot.get_or_init(|| {
            let mut hot: Vec<HotTrace> = (0..self.trace_max)
                .filter_map(|traceno| {
                    let mut vmst = IndexMap::new();
                    let mut total = 0;
                    for state in 0..self.vmst_max {
                        let count = self.count(traceno, state);
                        total += count;
                        vmst.insert(state_name(state), count);
                    }
                    (total > 0).then(|| HotTrace {
                        traceno: (traceno != 0).then_some(traceno as u32),
                        vmst,
                        total,
                    })
                })
                .collect();
            hot.sort_by(|a, b| b.total.cmp(&a.total));
            hot
        })
    }

    /// Counter-wise difference `other − self`; both profiles must share a
    /// shape. Counters are monotonic, so a negative cell clamps to zero.
    pub fn delta(&self, other: &VmProfile) -> Result<VmProfile, Error> {
        self.check_shape(other)?;
        Ok(self.derive(
            self.counts
                .iter()
                .zip(&other.counts)
                .map(|(a, b)| b.saturating_sub(*a))
                .collect(),
        ))
    }

    /// Counter-wise saturating sum, same shape constraint.
    pub fn sum(&self, other: &VmProfile) -> Result<VmProfile, Error> {
        self.check_shape(other)?;
        Ok(self.derive(
            self.counts
                .iter()
                .zip(&other.counts)
                .map(|(a, b)| a.saturating_add(*b))
                .collect(),
        ))
    }

    fn check_shape(&self, other: &VmProfile) -> Result<(), Error> {
        if self.trace_max != other.trace_max || self.vmst_max != other.vmst_max {
            return Err(Error::ProfileShape(
                self.trace_max,
                self.vmst_max,
                other.trace_max,
                other.vmst_max,
            ));
        }
        Ok(())
    }

    fn derive(&self, counts: Vec<u64>) -> VmProfile {
        VmProfile {
            major: self.major,
            minor: self.minor,
            trace_max: self.trace_max,
            vmst_max: self.vmst_max,
            counts,
            total: OnceCell::new(),
            vmst_totals: OnceCell::new(),
            hot: OnceCell::new(),
        }
    }
}

impl PartialEq for VmProfile {
    fn eq(&self, other: &Self) -> bool {
        self.trace_max == other.trace_max
            && self.vmst_max == other.vmst_max
            && self.counts == other.counts
    }
}

//! Post-mortem introspection for a tracing JIT runtime.
//!
//! The [`audit`] module reconstructs a queryable model (events,
//! prototypes, traces, compiled IR) out of an audit log and the debug
//! information embedded in it; [`vmprofile`] models the sampled
//! (trace, VM state) counter files produced by the same runtime.

pub mod audit;
pub mod vmprofile;

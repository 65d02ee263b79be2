//! Instruction execution, split by concern the way the dispatch loop
//! consumes it: calls and returns, channels, select, defer/panic
//! unwinding, conversions, comparisons, struct fields, goroutines and
//! range iteration. The hot arithmetic, move and jump paths stay inline
//! in the dispatch loop itself.

pub(crate) mod call;
pub(crate) mod channel;
pub(crate) mod cmp;
pub(crate) mod conv;
pub(crate) mod defer;
pub(crate) mod field;
pub(crate) mod goroutine;
pub(crate) mod iface;
pub(crate) mod iter;
pub(crate) mod select;

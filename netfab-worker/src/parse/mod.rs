//! Line-grammar parsers for backend tool output.
//!
//! Reconciliation re-derives state from live enumeration, so every backend
//! has an explicit parser here with its grammar documented and unit tests
//! pinned to literal captured output. Control-flow code never parses tool
//! output inline.

pub mod ip_link;
pub mod ipt;
pub mod ovs;

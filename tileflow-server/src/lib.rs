//! HTTP surface for the tileflow scheduler. Thin routing over
//! `tileflow_core::Scheduler`; see `http` for the endpoint set.

pub mod http;

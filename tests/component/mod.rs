//! tests/component/mod.rs
//!
//! Discovers the component-level test modules: black-box tests against the
//! engine directly, with no sockets or orchestrator involved.

mod engine;

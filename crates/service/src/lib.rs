//! The relay process: wires the configured store and bus into a producer and a
//! router and supervises both until shutdown.

pub mod app;

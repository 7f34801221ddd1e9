//! Stream assembly: indexed fragments in, parsed messages out.

pub mod assembler;
pub mod fragments;
pub mod throttle;
pub mod upstream;

pub use assembler::{AssemblerEvent, StreamAssembler, StreamSettings};

//! Session controller for client-side LLM chat over a WebGPU/WASM backend.

pub mod core;
pub mod infrastructure;

//! Core library for the rust_acq video acquisition runtime.
//!
//! This library contains the device registry, the simulated cameras, the
//! storage sinks (raw, tiff, zarr v2/v3), and the runtime that wires them
//! into per-stream capture pipelines. It is used by the `rust_acq` CLI
//! and by integration tests.

pub mod camera;
pub mod capabilities;
pub mod config;
pub mod core;
pub mod error;
pub mod manifest;
pub mod packet;
pub mod properties;
pub mod registry;
pub mod runtime;
pub mod storage;

mod stream;

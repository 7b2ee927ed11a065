//! # Pipelines Module
//!
//! High-level workflow orchestration: connects I/O, data structures, and
//! the model layer. Parallelisation (via rayon) and progress logging
//! happen here.

pub mod phasing;

pub use phasing::PhasingPipeline;

//! # Haploom Library
//!
//! Statistical phasing of diploid genotypes along a single chromosome
//! with a haploid Li-Stephens HMM whose state space is built from
//! PBWT-selected IBS neighbours.
//!
//! ## Modules
//! - `config`: CLI argument parsing and validation
//! - `data`: in-memory representations of genomic data
//! - `error`: error types and result alias
//! - `io`: file reading/writing (VCF, bref3, sliding windows)
//! - `model`: the statistical phasing engine (PBWT, IBS2, HMM)
//! - `pipelines`: windowed driver orchestration

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod model;
pub mod pipelines;

pub use config::Config;
pub use data::{GeneticMaps, HapIdx, Marker, MarkerIdx, Markers, SampleIdx, Samples};
pub use error::{HaploomError, Result};
pub use io::{Bref3Reader, Bref3Writer, VcfReader, VcfWriter};
pub use model::{EstPhase, FixedPhaseData, HmmUpdater, PbwtUpdater, PhaseData};
pub use pipelines::PhasingPipeline;

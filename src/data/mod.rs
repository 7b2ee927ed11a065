//! # Data Module
//!
//! ## Role
//! In-memory representations of genomic data.
//!
//! ## Design Philosophy
//! - **Structure of Arrays:** markers and per-marker genotype columns are
//!   stored separately for cache-friendly iteration.
//! - **Zero-cost newtypes:** `MarkerIdx`, `HapIdx`, `SampleIdx`, `ChromIdx`
//!   prevent index bugs at compile time with no runtime overhead.
//! - **Enum-based polymorphism:** the `TargGt` façade and the `RefColumn`
//!   storage enum replace virtual dispatch with tagged variants.
//!
//! ## Sub-modules
//! - `marker`: marker and allele definitions plus allele bit packing
//! - `haplotype`: index types for samples and haplotypes
//! - `genetic_map`: physical-to-genetic distance interpolation
//! - `gt`: read-only genotype façades (basic, haps, restricted, spliced)
//! - `storage`: reference-panel genotype storage backends

pub mod genetic_map;
pub mod gt;
pub mod haplotype;
pub mod marker;
pub mod storage;

pub use genetic_map::{GeneticMaps, MarkerMap};
pub use gt::{BasicGt, GtRec, HapsGt, RefGt, TargGt};
pub use haplotype::{HapIdx, SampleIdx, Samples};
pub use marker::{Allele, ChromIdx, Marker, MarkerIdx, Markers, MISSING_ALLELE};
pub use storage::RefColumn;

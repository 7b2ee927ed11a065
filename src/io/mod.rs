//! # I/O Module
//!
//! File reading and writing: VCF text input/output, the bref3 binary
//! reference codec, and the sliding-window streamer that chunks ordered
//! marker records into overlapping windows.

pub mod bref3;
pub mod vcf;
pub mod window;

pub use bref3::{Bref3Reader, Bref3Writer};
pub use vcf::{VcfReader, VcfWriter};
pub use window::{MarkerIndices, SlidingWindow, Window, WindowRec};

//! # Genetic Map Interpolation
//!
//! Converts physical positions (base pairs) to genetic distances
//! (centiMorgans) by linear interpolation of PLINK-format map points, and
//! precomputes per-window marker maps for the HMM.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::data::marker::{ChromIdx, MarkerIdx, Markers};
use crate::error::{HaploomError, Result};

/// Genetic distance rate assumed when no map is available: 1 cM per Mb
const DEFAULT_CM_PER_BP: f64 = 1e-6;

/// Minimum inter-marker genetic distance used for recombination
/// probabilities; keeps coincident markers from collapsing transitions.
const MIN_CM_DIST: f64 = 1e-7;

/// Genetic maps for all chromosomes seen in the input
#[derive(Clone, Debug, Default)]
pub struct GeneticMaps {
    /// Per-chromosome map points, indexed by `ChromIdx`; `None` falls back
    /// to the constant 1 cM/Mb rate.
    maps: Vec<Option<ChromMap>>,
}

/// Sorted (bp, cM) map points for one chromosome
#[derive(Clone, Debug)]
struct ChromMap {
    bp: Vec<u32>,
    cm: Vec<f64>,
}

impl GeneticMaps {
    /// Create an empty map collection (constant-rate interpolation)
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a PLINK-format map file (`chrom id cM bp` columns).
    ///
    /// Chromosomes absent from `chrom_names` are ignored; cM positions must
    /// be non-decreasing within a chromosome.
    pub fn from_plink_file(path: &Path, chrom_names: &[&str]) -> Result<Self> {
        Self::read_plink(path, |name| {
            chrom_names
                .iter()
                .position(|&n| n == name)
                .map(|i| ChromIdx::new(i as u16))
        })
    }

    /// Load a PLINK-format map file, interning every chromosome it names
    /// into the shared registry.
    pub fn from_plink_file_registry(
        path: &Path,
        registry: &std::sync::Arc<std::sync::Mutex<crate::data::marker::ChromRegistry>>,
    ) -> Result<Self> {
        Self::read_plink(path, |name| {
            Some(
                registry
                    .lock()
                    .expect("chromosome registry poisoned")
                    .get_or_insert(name),
            )
        })
    }

    fn read_plink(path: &Path, mut chrom_idx: impl FnMut(&str) -> Option<ChromIdx>) -> Result<Self> {
        let file = File::open(path)?;
        let mut maps: Vec<Option<ChromMap>> = Vec::new();

        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let chrom = fields
                .next()
                .ok_or_else(|| HaploomError::parse(line_no + 1, "missing chrom column"))?;
            let _id = fields
                .next()
                .ok_or_else(|| HaploomError::parse(line_no + 1, "missing id column"))?;
            let cm: f64 = fields
                .next()
                .ok_or_else(|| HaploomError::parse(line_no + 1, "missing cM column"))?
                .parse()
                .map_err(|_| HaploomError::parse(line_no + 1, "invalid cM value"))?;
            let bp: u32 = fields
                .next()
                .ok_or_else(|| HaploomError::parse(line_no + 1, "missing bp column"))?
                .parse()
                .map_err(|_| HaploomError::parse(line_no + 1, "invalid bp value"))?;

            let Some(idx) = chrom_idx(chrom) else {
                continue;
            };
            if maps.len() <= idx.as_usize() {
                maps.resize(idx.as_usize() + 1, None);
            }
            let map = maps[idx.as_usize()].get_or_insert_with(|| ChromMap {
                bp: Vec::new(),
                cm: Vec::new(),
            });
            if let (Some(&last_bp), Some(&last_cm)) = (map.bp.last(), map.cm.last()) {
                if bp <= last_bp || cm < last_cm {
                    return Err(HaploomError::map(format!(
                        "{}: map positions not increasing at line {}",
                        path.display(),
                        line_no + 1
                    )));
                }
            }
            map.bp.push(bp);
            map.cm.push(cm);
        }

        Ok(Self { maps })
    }

    /// Genetic position (cM) of a physical position
    pub fn gen_pos(&self, chrom: ChromIdx, bp: u32) -> f64 {
        match self.maps.get(chrom.as_usize()).and_then(|m| m.as_ref()) {
            Some(map) if map.bp.len() >= 2 => map.interpolate(bp),
            _ => bp as f64 * DEFAULT_CM_PER_BP,
        }
    }

    /// Genetic distance (cM) between two physical positions
    pub fn gen_dist(&self, chrom: ChromIdx, bp1: u32, bp2: u32) -> f64 {
        (self.gen_pos(chrom, bp2) - self.gen_pos(chrom, bp1)).abs()
    }
}

impl ChromMap {
    /// Linear interpolation; extrapolates with the terminal interval's slope
    fn interpolate(&self, bp: u32) -> f64 {
        let n = self.bp.len();
        let i = match self.bp.binary_search(&bp) {
            Ok(i) => return self.cm[i],
            Err(i) => i,
        };
        let (lo, hi) = if i == 0 {
            (0, 1)
        } else if i >= n {
            (n - 2, n - 1)
        } else {
            (i - 1, i)
        };
        let bp_lo = self.bp[lo] as f64;
        let bp_hi = self.bp[hi] as f64;
        let slope = (self.cm[hi] - self.cm[lo]) / (bp_hi - bp_lo);
        self.cm[lo] + (bp as f64 - bp_lo) * slope
    }
}

/// Genetic positions and inter-marker distances for one marker window
#[derive(Clone, Debug)]
pub struct MarkerMap {
    gen_pos: Vec<f64>,
    gen_dist: Vec<f64>,
}

impl MarkerMap {
    /// Build the map for the given markers
    pub fn create(gen_maps: &GeneticMaps, markers: &Markers) -> Self {
        let gen_pos: Vec<f64> = markers
            .iter()
            .map(|m| gen_maps.gen_pos(m.chrom, m.pos))
            .collect();
        Self::from_gen_pos(gen_pos)
    }

    /// Build directly from genetic positions
    pub fn from_gen_pos(gen_pos: Vec<f64>) -> Self {
        let gen_dist = std::iter::once(0.0)
            .chain(
                gen_pos
                    .windows(2)
                    .map(|w| (w[1] - w[0]).max(MIN_CM_DIST)),
            )
            .collect();
        Self { gen_pos, gen_dist }
    }

    /// Number of markers
    pub fn n_markers(&self) -> usize {
        self.gen_pos.len()
    }

    /// Genetic position (cM) of the marker with the given index
    #[inline]
    pub fn gen_pos(&self, m: MarkerIdx) -> f64 {
        self.gen_pos[m.as_usize()]
    }

    /// All genetic positions
    pub fn gen_positions(&self) -> &[f64] {
        &self.gen_pos
    }

    /// Genetic distance between marker `m` and marker `m - 1`
    /// (0.0 for the first marker)
    #[inline]
    pub fn gen_dist(&self, m: MarkerIdx) -> f64 {
        self.gen_dist[m.as_usize()]
    }

    /// Restrict to the markers with the given (strictly increasing) indices
    pub fn restrict(&self, indices: &[usize]) -> Self {
        let gen_pos = indices.iter().map(|&m| self.gen_pos[m]).collect();
        Self::from_gen_pos(gen_pos)
    }

    /// Per-marker probability of transitioning to a random HMM state:
    /// `p[m] = 1 - exp(-recomb_factor * gen_dist(m))`, with `p[0] = 0`.
    pub fn p_recomb(&self, recomb_factor: f32) -> Vec<f32> {
        self.gen_dist
            .iter()
            .map(|&d| (-(-(recomb_factor as f64) * d).exp_m1()) as f32)
            .collect()
    }
}

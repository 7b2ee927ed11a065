//! # Coded Steps
//!
//! Partitions the (high-frequency) markers into genetic-length steps and
//! assigns every haplotype an integer sequence id describing its allele
//! pattern across each step. Sequence id 0 is reserved for patterns that
//! occur only in the reference panel, so reference-only diversity is
//! pooled into a single PBWT symbol.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;

use crate::data::genetic_map::MarkerMap;
use crate::data::gt::{HapsGt, RefGt};
use crate::data::haplotype::HapIdx;
use crate::data::marker::MarkerIdx;

/// Minimum number of steps after scale-factor resizing
const MIN_STEPS: usize = 40;

/// Map from haplotype index to sequence id for one step
#[derive(Clone, Debug)]
pub struct IndexedSeqs {
    /// Sequence id per haplotype (target haplotypes first)
    pub hap_to_seq: Vec<u32>,
    /// Number of distinct sequence values (ids are `< n_seq`)
    pub n_seq: u32,
}

/// Coded-step partition of the phased haplotypes
pub struct CodedSteps {
    step_starts: Vec<u32>,
    steps: Vec<Arc<IndexedSeqs>>,
    n_markers: usize,
    n_haps: usize,
    n_targ_haps: usize,
}

impl CodedSteps {
    /// Build coded steps over the current phased target haplotypes and the
    /// optional reference panel.
    ///
    /// Step starts advance by `step_cm` with a uniformly random first
    /// offset; if `scale_factor != 1.0` the step list is resized by whole
    /// replication plus a partially shuffled remainder.
    pub fn new(
        targ: &HapsGt,
        ref_gt: Option<&RefGt>,
        map: &MarkerMap,
        step_cm: f64,
        scale_factor: f32,
        seed: u64,
    ) -> Self {
        let n_markers = targ.n_markers();
        assert_eq!(map.n_markers(), n_markers, "marker map length mismatch");
        if let Some(r) = ref_gt {
            assert_eq!(r.n_markers(), n_markers, "reference marker count mismatch");
        }
        let n_targ_haps = targ.n_haps();
        let n_haps = n_targ_haps + ref_gt.map_or(0, |r| r.n_haps());

        let mut rng = StdRng::seed_from_u64(seed);
        let step_starts0 = step_starts(map.gen_positions(), step_cm, &mut rng);
        let steps0: Vec<Arc<IndexedSeqs>> = (0..step_starts0.len())
            .into_par_iter()
            .map(|j| {
                let start = step_starts0[j] as usize;
                let end = step_starts0
                    .get(j + 1)
                    .map(|&s| s as usize)
                    .unwrap_or(n_markers);
                Arc::new(code_step(targ, ref_gt, n_targ_haps, n_haps, start, end))
            })
            .collect();

        let (step_starts, steps) = if scale_factor == 1.0 {
            (step_starts0, steps0)
        } else {
            let indices = resized_indices(step_starts0.len(), scale_factor, &mut rng);
            let starts = indices.iter().map(|&j| step_starts0[j]).collect();
            let steps = indices.iter().map(|&j| Arc::clone(&steps0[j])).collect();
            (starts, steps)
        };

        Self {
            step_starts,
            steps,
            n_markers,
            n_haps,
            n_targ_haps,
        }
    }

    pub fn n_steps(&self) -> usize {
        self.step_starts.len()
    }

    pub fn n_markers(&self) -> usize {
        self.n_markers
    }

    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    pub fn n_targ_haps(&self) -> usize {
        self.n_targ_haps
    }

    /// First marker index of the step
    pub fn step_start(&self, step: usize) -> usize {
        self.step_starts[step] as usize
    }

    /// Exclusive end marker index of the step
    pub fn step_end(&self, step: usize) -> usize {
        self.step_starts
            .get(step + 1)
            .map(|&s| s as usize)
            .unwrap_or(self.n_markers)
    }

    /// The haplotype-to-sequence map of the step
    pub fn get(&self, step: usize) -> &IndexedSeqs {
        &self.steps[step]
    }
}

/// Step starts: the first step length is a random fraction of `step_cm`
fn step_starts(gen_pos: &[f64], step_cm: f64, rng: &mut StdRng) -> Vec<u32> {
    let mut starts = vec![0u32];
    if gen_pos.is_empty() {
        return starts;
    }
    let mut next_pos = gen_pos[0] + rng.gen::<f64>() * step_cm;
    let mut index = next_index(gen_pos, 0, next_pos);
    while index < gen_pos.len() {
        starts.push(index as u32);
        next_pos = gen_pos[index] + step_cm;
        index = next_index(gen_pos, index, next_pos);
    }
    starts
}

fn next_index(gen_pos: &[f64], start: usize, target_pos: f64) -> usize {
    start + gen_pos[start..].partition_point(|&p| p < target_pos)
}

/// Resized step indices: whole replications plus a partially shuffled
/// remainder, sorted.
fn resized_indices(size: usize, scale_factor: f32, rng: &mut StdRng) -> Vec<usize> {
    let mut new_len = (size as f64 * scale_factor as f64).ceil() as usize;
    if new_len < MIN_STEPS {
        new_len = MIN_STEPS;
    }
    let quotient = new_len / size;
    let remainder = new_len - quotient * size;

    let mut indices: Vec<usize> = (0..size).collect();
    let mut resized = Vec::with_capacity(new_len);
    for _ in 0..quotient {
        resized.extend(0..size);
    }
    if remainder > 0 {
        let (shuffled, _) = indices.partial_shuffle(rng, remainder);
        resized.extend_from_slice(shuffled);
    }
    resized.sort_unstable();
    resized
}

/// Assign sequence ids for one step.
///
/// Every haplotype starts at sequence 1; ids are reassigned marker by
/// marker from a `(sequence, allele)` table. Target haplotypes mint new
/// ids; reference haplotypes follow the table and fall to the pooled id 0
/// when their pattern was never seen in a target haplotype.
fn code_step(
    targ: &HapsGt,
    ref_gt: Option<&RefGt>,
    n_targ_haps: usize,
    n_haps: usize,
    start: usize,
    end: usize,
) -> IndexedSeqs {
    let allele = |m: usize, h: usize| -> usize {
        if h < n_targ_haps {
            targ.allele(MarkerIdx::new(m as u32), HapIdx::new(h as u32)) as usize
        } else {
            ref_gt
                .expect("haplotype index beyond target range without reference")
                .allele(MarkerIdx::new(m as u32), HapIdx::new((h - n_targ_haps) as u32))
                as usize
        }
    };

    if end - start == 1 {
        // a single marker codes directly by allele
        let m = start;
        let n_alleles = targ.markers().marker(MarkerIdx::new(m as u32)).n_alleles();
        let hap_to_seq = (0..n_haps).map(|h| allele(m, h) as u32).collect();
        return IndexedSeqs {
            hap_to_seq,
            n_seq: n_alleles as u32,
        };
    }

    let mut hap_to_seq = vec![1u32; n_haps];
    let mut seq_cnt = 2usize; // seq 0 reserved for reference-only patterns
    for m in start..end {
        let n_alleles = targ.markers().marker(MarkerIdx::new(m as u32)).n_alleles();
        let mut seq_map = vec![0u32; seq_cnt * n_alleles];
        seq_cnt = 1;
        for h in 0..n_targ_haps {
            let index = n_alleles * hap_to_seq[h] as usize + allele(m, h);
            if seq_map[index] == 0 {
                seq_map[index] = seq_cnt as u32;
                seq_cnt += 1;
            }
            hap_to_seq[h] = seq_map[index];
        }
        for h in n_targ_haps..n_haps {
            if hap_to_seq[h] != 0 {
                let index = hap_to_seq[h] as usize * n_alleles + allele(m, h);
                hap_to_seq[h] = seq_map[index];
            }
        }
    }
    IndexedSeqs {
        hap_to_seq,
        n_seq: seq_cnt as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::gt::HapsGt;
    use crate::data::haplotype::Samples;
    use crate::data::marker::{Allele, ChromIdx, Marker, Markers};
    use crate::data::storage::RefColumn;

    fn haps_gt(haps: &[&[u8]]) -> HapsGt {
        let n_markers = haps[0].len();
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n_markers {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 1000,
                Vec::new(),
                vec![Allele::Base(0), Allele::Base(1)],
            ));
        }
        let markers = Arc::new(markers);
        let ids: Vec<String> = (0..haps.len() / 2).map(|s| format!("S{}", s)).collect();
        let samples = Arc::new(Samples::from_ids(&ids));
        let packed = haps
            .iter()
            .map(|h| Arc::new(markers.alleles_to_bits(h)))
            .collect();
        HapsGt::new(markers, samples, packed)
    }

    fn uniform_map(n_markers: usize, cm_per_marker: f64) -> MarkerMap {
        MarkerMap::from_gen_pos((0..n_markers).map(|m| m as f64 * cm_per_marker).collect())
    }

    #[test]
    fn test_target_only_coding() {
        let targ = haps_gt(&[
            &[0, 0, 1],
            &[0, 0, 1],
            &[1, 0, 1],
            &[0, 1, 0],
        ]);
        let map = uniform_map(3, 0.001);
        // a single step covering all markers
        let cs = CodedSteps::new(&targ, None, &map, 10.0, 1.0, 7);
        assert_eq!(cs.n_steps(), 1);
        let step = cs.get(0);
        // haplotypes 0 and 1 share a pattern; 2 and 3 are unique
        assert_eq!(step.hap_to_seq[0], step.hap_to_seq[1]);
        assert_ne!(step.hap_to_seq[0], step.hap_to_seq[2]);
        assert_ne!(step.hap_to_seq[2], step.hap_to_seq[3]);
        // no target pattern gets the reserved sequence 0
        assert!(step.hap_to_seq.iter().all(|&s| s != 0));
        assert_eq!(step.n_seq, 4); // 0 (reserved) + 3 patterns
    }

    #[test]
    fn test_reference_only_patterns_pool_to_zero() {
        let targ = haps_gt(&[&[0, 0], &[0, 1]]);
        let samples = Arc::new(Samples::from_ids(["R0"]));
        let ref_markers = targ.markers().clone();
        let recs = vec![
            Arc::new(RefColumn::from_alleles(&[1, 0], 2)),
            Arc::new(RefColumn::from_alleles(&[1, 0], 2)),
        ];
        let ref_gt = RefGt::new(ref_markers, samples, recs);
        let map = uniform_map(2, 0.001);

        let cs = CodedSteps::new(&targ, Some(&ref_gt), &map, 10.0, 1.0, 3);
        let step = cs.get(0);
        assert_eq!(cs.n_haps(), 4);
        assert_eq!(cs.n_targ_haps(), 2);
        // ref hap 0 carries pattern (1,1), unseen in the target: pooled to 0
        assert_eq!(step.hap_to_seq[2], 0);
        // ref hap 1 carries pattern (0,0), identical to target hap 0
        assert_eq!(step.hap_to_seq[3], step.hap_to_seq[0]);
    }

    #[test]
    fn test_step_starts_spacing() {
        let gen_pos: Vec<f64> = (0..500).map(|m| m as f64 * 0.002).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let starts = step_starts(&gen_pos, 0.1, &mut rng);
        assert_eq!(starts[0], 0);
        // steps after the first advance by ~0.1 cM = ~50 markers
        for w in starts.windows(2).skip(1) {
            let dist = gen_pos[w[1] as usize] - gen_pos[w[0] as usize];
            assert!(dist >= 0.1 - 1e-9, "step of {} cM", dist);
            assert!(dist < 0.11, "step of {} cM", dist);
        }
    }

    #[test]
    fn test_resized_indices() {
        let mut rng = StdRng::seed_from_u64(5);
        let indices = resized_indices(50, 2.0, &mut rng);
        assert_eq!(indices.len(), 100);
        assert!(indices.windows(2).all(|w| w[0] <= w[1]));

        // a small list is padded up to the minimum step count
        let indices = resized_indices(10, 1.5, &mut rng);
        assert_eq!(indices.len(), MIN_STEPS);
    }
}

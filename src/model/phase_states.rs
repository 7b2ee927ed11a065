//! # Composite Reference State Builder
//!
//! Turns the stream of (IBS haplotype, step) events produced by the
//! neighbour finders into at most `max_states` composite reference
//! haplotypes. A composite haplotype is a mosaic of reference-haplotype
//! segments joined at step midpoints; a priority queue keyed by each
//! slot's last-seen step decides which slot is recycled when a new
//! haplotype arrives.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::IbsHaps;

/// A copied haplotype segment in a composite reference haplotype.
/// Ordered by step only; the heap keeps the stalest slot on top.
#[derive(Clone, Copy, Debug)]
struct CompHapSegment {
    hap: u32,
    step: u32,
    comp_hap_index: usize,
}

impl PartialEq for CompHapSegment {
    fn eq(&self, other: &Self) -> bool {
        self.step == other.step
    }
}

impl Eq for CompHapSegment {}

impl PartialOrd for CompHapSegment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompHapSegment {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, the queue needs min-by-step
        other.step.cmp(&self.step)
    }
}

/// Builds the Li-Stephens state space for a target haplotype or sample
pub struct PhaseStates<'a, 'f> {
    pd: &'a PhaseData<'f>,
    n_markers: usize,
    max_states: usize,
    min_steps: u32,

    /// Last step at which each queued haplotype was seen
    hap_to_end: HashMap<u32, u32>,
    q: BinaryHeap<CompHapSegment>,
    /// Per slot: the haplotypes of its segments in order
    composite_hap_to_hap: Vec<Vec<u32>>,
    /// Per slot: the exclusive end marker of each segment but the last
    composite_hap_to_end: Vec<Vec<u32>>,

    // cursors used while copying the mosaic out
    comp_hap_to_list_index: Vec<usize>,
    comp_hap_to_hap: Vec<u32>,
    comp_hap_to_end: Vec<u32>,
}

impl<'a, 'f> PhaseStates<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>, max_states: usize) -> Self {
        assert!(max_states >= 1, "max_states must be positive");
        Self {
            pd,
            n_markers: pd.n_markers(),
            max_states,
            min_steps: pd.min_steps() as u32,
            hap_to_end: HashMap::with_capacity(max_states),
            q: BinaryHeap::with_capacity(max_states),
            composite_hap_to_hap: vec![Vec::new(); max_states],
            composite_hap_to_end: vec![Vec::new(); max_states],
            comp_hap_to_list_index: vec![0; max_states],
            comp_hap_to_hap: vec![0; max_states],
            comp_hap_to_end: vec![0; max_states],
        }
    }

    /// Maximum number of HMM states at a marker
    pub fn max_states(&self) -> usize {
        self.max_states
    }

    /// Build the HMM for a target sample.
    ///
    /// Stores, per marker and state, the number of allele mismatches (0/1)
    /// against `hap1` and `hap2` in `n_mismatches1`/`n_mismatches2`; for
    /// markers where either input allele is negative (missing), the state
    /// alleles are stored in the next row of `ref_al`. Returns the number
    /// of states.
    #[allow(clippy::too_many_arguments)]
    pub fn ibs_states(
        &mut self,
        ibs: &dyn IbsHaps,
        sample: u32,
        hap1: &[i32],
        hap2: &[i32],
        ref_al: &mut Vec<Vec<i32>>,
        n_mismatches1: &mut [Vec<u8>],
        n_mismatches2: &mut [Vec<u8>],
    ) -> usize {
        let h1 = sample << 1;
        let h2 = h1 | 1;
        self.initialize();
        for step in 0..self.pd.coded_steps().n_steps() {
            ibs.add_ibs_haps(h1, step, self);
            ibs.add_ibs_haps(h2, step, self);
        }
        if self.q.is_empty() {
            self.fill_q_with_random_haps(h1);
        }
        self.copy_sample_data(hap1, hap2, ref_al, n_mismatches1, n_mismatches2)
    }

    /// Build the HMM for a single target haplotype.
    ///
    /// Stores, per marker and state, the reference haplotype in `haps` and
    /// its mismatch count against the target haplotype in `n_mismatches`.
    /// Returns the number of states.
    pub fn ibs_states_hap(
        &mut self,
        ibs: &dyn IbsHaps,
        targ_hap: u32,
        haps: &mut [Vec<u32>],
        n_mismatches: &mut [Vec<u8>],
    ) -> usize {
        self.initialize();
        for step in 0..self.pd.coded_steps().n_steps() {
            ibs.add_ibs_haps(targ_hap, step, self);
        }
        if self.q.is_empty() {
            self.fill_q_with_random_haps(targ_hap);
        }
        self.copy_hap_data(targ_hap, haps, n_mismatches)
    }

    fn initialize(&mut self) {
        self.hap_to_end.clear();
        for j in 0..self.q.len() {
            self.composite_hap_to_hap[j].clear();
            self.composite_hap_to_end[j].clear();
        }
        self.q.clear();
    }

    /// Record that `hap` was seen as an IBS match at `step`
    pub fn update_fields(&mut self, hap: u32, step: usize) {
        let step = step as u32;
        if !self.hap_to_end.contains_key(&hap) {
            self.update_head_of_q();
            let recycle = self.q.len() == self.max_states
                || self
                    .q
                    .peek()
                    .is_some_and(|head| step > head.step && step - head.step > self.min_steps);
            if recycle {
                let head = self.q.pop().expect("queue cannot be empty when full");
                let mod_end = self
                    .pd
                    .coded_steps()
                    .step_start(((head.step + step) >> 1) as usize) as u32;
                self.hap_to_end.remove(&head.hap);
                self.composite_hap_to_hap[head.comp_hap_index].push(hap);
                self.composite_hap_to_end[head.comp_hap_index].push(mod_end);
                self.q.push(CompHapSegment {
                    hap,
                    step,
                    comp_hap_index: head.comp_hap_index,
                });
            } else {
                let comp_hap_index = self.q.len();
                self.composite_hap_to_hap[comp_hap_index].push(hap);
                self.q.push(CompHapSegment {
                    hap,
                    step,
                    comp_hap_index,
                });
            }
        }
        self.hap_to_end.insert(hap, step);
    }

    /// Re-key queue entries whose haplotype was seen again after they were
    /// pushed (lazy decrease-key).
    fn update_head_of_q(&mut self) {
        while let Some(head) = self.q.peek() {
            let latest_end = self.hap_to_end[&head.hap];
            if head.step == latest_end {
                break;
            }
            let mut head = self.q.pop().expect("peeked entry vanished");
            head.step = latest_end;
            self.q.push(head);
        }
    }

    fn copy_sample_data(
        &mut self,
        hap1: &[i32],
        hap2: &[i32],
        ref_al: &mut Vec<Vec<i32>>,
        n_mismatches1: &mut [Vec<u8>],
        n_mismatches2: &mut [Vec<u8>],
    ) -> usize {
        let n_comp_haps = self.q.len();
        self.initialize_copy(n_comp_haps);
        let mut miss_index = 0;
        for m in 0..self.n_markers {
            let is_missing = hap1[m] == -1 || hap2[m] == -1;
            if is_missing && ref_al.len() <= miss_index {
                ref_al.push(vec![0; self.max_states]);
            }
            for j in 0..n_comp_haps {
                if m as u32 == self.comp_hap_to_end[j] {
                    self.comp_hap_to_list_index[j] += 1;
                    let li = self.comp_hap_to_list_index[j];
                    self.comp_hap_to_hap[j] = self.composite_hap_to_hap[j][li];
                    self.comp_hap_to_end[j] = self.composite_hap_to_end[j][li];
                }
                let ref_allele = self.pd.allele(m, self.comp_hap_to_hap[j]) as i32;
                if is_missing {
                    ref_al[miss_index][j] = ref_allele;
                    n_mismatches1[m][j] = 0;
                    n_mismatches2[m][j] = 0;
                } else {
                    n_mismatches1[m][j] = u8::from(ref_allele != hap1[m]);
                    n_mismatches2[m][j] = u8::from(ref_allele != hap2[m]);
                }
            }
            if is_missing {
                miss_index += 1;
            }
        }
        n_comp_haps
    }

    fn copy_hap_data(
        &mut self,
        targ_hap: u32,
        haps: &mut [Vec<u32>],
        n_mismatches: &mut [Vec<u8>],
    ) -> usize {
        let n_comp_haps = self.q.len();
        self.initialize_copy(n_comp_haps);
        for m in 0..self.n_markers {
            let targ_al = self.pd.allele(m, targ_hap);
            for j in 0..n_comp_haps {
                if m as u32 == self.comp_hap_to_end[j] {
                    self.comp_hap_to_list_index[j] += 1;
                    let li = self.comp_hap_to_list_index[j];
                    self.comp_hap_to_hap[j] = self.composite_hap_to_hap[j][li];
                    self.comp_hap_to_end[j] = self.composite_hap_to_end[j][li];
                }
                let ref_hap = self.comp_hap_to_hap[j];
                haps[m][j] = ref_hap;
                n_mismatches[m][j] = u8::from(self.pd.allele(m, ref_hap) != targ_al);
            }
        }
        n_comp_haps
    }

    /// Append the terminal segment end and reset the copy cursors
    fn initialize_copy(&mut self, n_slots: usize) {
        for j in 0..n_slots {
            self.composite_hap_to_end[j].push(self.n_markers as u32);
            self.comp_hap_to_list_index[j] = 0;
            self.comp_hap_to_hap[j] = self.composite_hap_to_hap[j][0];
            self.comp_hap_to_end[j] = self.composite_hap_to_end[j][0];
        }
    }

    /// When no IBS haplotype was found at all, seed the queue with random
    /// non-self haplotypes.
    fn fill_q_with_random_haps(&mut self, hap: u32) {
        debug_assert!(self.q.is_empty());
        let n_haps = self.pd.n_haps();
        let n_states = n_haps.saturating_sub(2).min(self.max_states);
        assert!(n_states > 0, "phasing requires at least two samples");
        let sample = hap >> 1;
        let mut rng = StdRng::seed_from_u64(self.pd.seed().wrapping_add(hap as u64));
        for i in 0..n_states {
            let mut h = rng.gen_range(0..n_haps as u32);
            while (h >> 1) == sample {
                h = rng.gen_range(0..n_haps as u32);
            }
            self.composite_hap_to_hap[self.q.len()].push(h);
            self.q.push(CompHapSegment {
                hap: h,
                step: self.n_markers as u32,
                comp_hap_index: i,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::data::genetic_map::GeneticMaps;
    use crate::data::gt::{BasicGt, GtRec, TargGt};
    use crate::data::haplotype::Samples;
    use crate::data::marker::{Allele, ChromIdx, Marker, Markers};
    use crate::io::window::{MarkerIndices, Window};
    use crate::model::est_phase::EstPhase;
    use crate::model::fixed_phase_data::FixedPhaseData;
    use crate::model::phase_ibs::PbwtPhaseIbs;
    use std::sync::Arc;

    fn build_fpd(n_samples: usize, n_markers: usize) -> FixedPhaseData {
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n_markers {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 100_000,
                Vec::new(),
                vec![Allele::Base(0), Allele::Base(1)],
            ));
        }
        let ids: Vec<String> = (0..n_samples).map(|s| format!("S{}", s)).collect();
        let samples = Arc::new(Samples::from_ids(&ids));
        let recs = (0..n_markers)
            .map(|m| {
                let a1 = (0..n_samples).map(|s| ((s * 5 + m) % 2) as u8).collect();
                let a2 = (0..n_samples).map(|s| ((s * 3 + m) % 2) as u8).collect();
                GtRec::new(a1, a2, vec![false; n_samples])
            })
            .collect();
        let targ_gt = TargGt::Basic(Arc::new(BasicGt::new(markers.clone(), samples, recs)));
        let window = Window {
            index: 1,
            markers,
            targ_gt,
            ref_gt: None,
            indices: MarkerIndices::new(&vec![true; n_markers], 0, n_markers),
            last_on_chrom: true,
        };
        FixedPhaseData::new(&test_config(), &GeneticMaps::new(), &window, None)
    }

    #[test]
    fn test_capacity_and_coverage() {
        let fpd = build_fpd(8, 12);
        let mut config = test_config();
        config.phase_states = 3; // tiny capacity forces slot recycling
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 11);
        let pd = crate::model::phase_data::PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 11);
        let ibs = PbwtPhaseIbs::new(&pd, false);

        let max_states = 3;
        let mut states = PhaseStates::new(&pd, max_states);
        let n_markers = pd.n_markers();
        let mut haps = vec![vec![0u32; max_states]; n_markers];
        let mut mismatches = vec![vec![0u8; max_states]; n_markers];
        let n_states = states.ibs_states_hap(&ibs, 0, &mut haps, &mut mismatches);

        // the queue never exceeds its capacity
        assert!(n_states >= 1 && n_states <= max_states);
        // every composite slot yields a haplotype at every marker and the
        // mismatch flags agree with the target's snapshot alleles
        for m in 0..n_markers {
            for j in 0..n_states {
                let ref_hap = haps[m][j];
                assert!((ref_hap as usize) < pd.n_haps());
                assert_ne!(ref_hap >> 1, 0, "own sample must not enter the state space");
                let expected = u8::from(pd.allele(m, ref_hap) != pd.allele(m, 0));
                assert_eq!(mismatches[m][j], expected);
            }
        }
    }

    #[test]
    fn test_random_fill_excludes_self() {
        let fpd = build_fpd(4, 6);
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 13);
        let pd = crate::model::phase_data::PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 13);

        let mut states = PhaseStates::new(&pd, 5);
        states.fill_q_with_random_haps(2);
        assert!(!states.q.is_empty());
        for entry in states.q.iter() {
            assert_ne!(entry.hap >> 1, 1, "own sample in random fill");
        }
    }

    #[test]
    fn test_min_heap_ordering() {
        let mut q = BinaryHeap::new();
        q.push(CompHapSegment {
            hap: 0,
            step: 5,
            comp_hap_index: 0,
        });
        q.push(CompHapSegment {
            hap: 1,
            step: 2,
            comp_hap_index: 1,
        });
        q.push(CompHapSegment {
            hap: 2,
            step: 9,
            comp_hap_index: 2,
        });
        // the stalest (smallest step) entry is on top
        assert_eq!(q.pop().unwrap().step, 2);
        assert_eq!(q.pop().unwrap().step, 5);
        assert_eq!(q.pop().unwrap().step, 9);
    }
}

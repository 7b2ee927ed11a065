//! # Low-Frequency Best-Match Finder
//!
//! For each coded step, finds for each target haplotype a haplotype from a
//! distinct sample that carries a shared low-frequency variant inside the
//! step and shares a long IBS sequence with it. The candidate lists are
//! seeded from rare-allele carrier lists and refined step by step with the
//! coded sequences; a list stays alive only while it holds haplotypes from
//! at least two samples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::{IbsHaps, PbwtPhaseIbs};
use crate::model::phase_states::PhaseStates;

/// Salt that separates the backward match RNG stream from the forward one
const BWD_SEED_SALT: u64 = 1009;

/// Finds rare-variant-sharing IBS matches around one step
pub struct BestMatch<'a, 'f> {
    pd: &'a PhaseData<'f>,
    n_targ_haps: usize,
    n_buffer_steps: usize,
}

impl<'a, 'f> BestMatch<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>) -> Self {
        let config = pd.config();
        let n_buffer_steps = (config.buffer / config.phase_step).round() as usize;
        Self {
            pd,
            n_targ_haps: pd.n_targ_haps(),
            n_buffer_steps,
        }
    }

    /// Map each target haplotype to a forward-direction match, or -1
    pub fn fwd_match(&self, step: usize) -> Vec<i32> {
        let coded_steps = self.pd.coded_steps();
        let mut best_hap = vec![-1i32; self.n_targ_haps];
        let end_step = (step + self.n_buffer_steps).min(coded_steps.n_steps());
        let mut rng = StdRng::seed_from_u64(self.pd.seed().wrapping_add(step as u64));
        let mut hap_lists = self.low_freq_hap_lists(step);
        let mut j = step;
        while j < end_step && !hap_lists.is_empty() {
            hap_lists = self.next_hap_lists(hap_lists, j);
            self.update_best_haps(&hap_lists, &mut best_hap, &mut rng);
            j += 1;
        }
        best_hap
    }

    /// Map each target haplotype to a backward-direction match, or -1
    pub fn bwd_match(&self, step: usize) -> Vec<i32> {
        let mut best_hap = vec![-1i32; self.n_targ_haps];
        let end_step = step as i64 - self.n_buffer_steps as i64;
        let mut rng =
            StdRng::seed_from_u64(self.pd.seed().wrapping_add(BWD_SEED_SALT + step as u64));
        let mut hap_lists = self.low_freq_hap_lists(step);
        let mut j = step as i64;
        while j > end_step && j >= 0 && !hap_lists.is_empty() {
            hap_lists = self.next_hap_lists(hap_lists, j as usize);
            self.update_best_haps(&hap_lists, &mut best_hap, &mut rng);
            j -= 1;
        }
        best_hap
    }

    /// Seed candidate lists from low-frequency carriers of markers inside
    /// the step (carrier sample indices expand to their two haplotypes).
    fn low_freq_hap_lists(&self, step: usize) -> Vec<Vec<u32>> {
        let fpd = self.pd.fpd();
        let coded_steps = self.pd.coded_steps();
        let hi_freq = fpd.hi_freq_indices();
        // the step is defined over high-frequency markers; carrier lists
        // live in all-marker space
        let start = if step == 0 {
            0
        } else {
            hi_freq[coded_steps.step_start(step)] as usize
        };
        let end = if step + 1 < coded_steps.n_steps() {
            hi_freq[coded_steps.step_start(step + 1)] as usize
        } else {
            fpd.targ_gt().n_markers()
        };

        let mut hap_lists = Vec::new();
        let markers = fpd.targ_gt().markers();
        for m in start..end {
            let n_alleles = markers
                .marker(crate::data::marker::MarkerIdx::new(m as u32))
                .n_alleles();
            for al in 0..n_alleles {
                let carriers = fpd.carriers(m, al as u8).samples();
                if carriers.len() > 1 {
                    let mut hap_list = Vec::with_capacity(2 * carriers.len());
                    for &sample in carriers {
                        let h1 = sample << 1;
                        hap_list.push(h1);
                        hap_list.push(h1 | 1);
                    }
                    hap_lists.push(hap_list);
                }
            }
        }
        hap_lists
    }

    /// Split each list by the coded sequence at the given step, keeping
    /// children that still pair a target haplotype with another sample.
    fn next_hap_lists(&self, hap_lists: Vec<Vec<u32>>, step: usize) -> Vec<Vec<u32>> {
        let coded = self.pd.coded_steps().get(step);
        let mut seq_to_child = vec![-1i32; coded.n_seq as usize];
        let mut next_lists = Vec::new();
        let mut children: Vec<Vec<u32>> = Vec::new();

        for hap_list in hap_lists {
            seq_to_child.fill(-1);
            children.clear();
            for &hap in &hap_list {
                let seq = coded.hap_to_seq[hap as usize] as usize;
                if seq_to_child[seq] == -1 {
                    seq_to_child[seq] = children.len() as i32;
                    children.push(Vec::with_capacity(8));
                }
                children[seq_to_child[seq] as usize].push(hap);
            }
            for child in children.drain(..) {
                if child.len() >= 2 {
                    let hap0 = child[0];
                    // the list is increasing: a live list needs a target
                    // haplotype and a second sample
                    if (hap0 as usize) < self.n_targ_haps
                        && (child.len() > 2 || (hap0 ^ child[1]) != 1)
                    {
                        next_lists.push(child);
                    }
                }
            }
        }
        next_lists
    }

    fn update_best_haps(&self, hap_lists: &[Vec<u32>], best_hap: &mut [i32], rng: &mut StdRng) {
        for haps in hap_lists {
            self.update_best_hap(haps, best_hap, rng);
        }
    }

    /// For each target haplotype in the list, pick a random haplotype from
    /// a different sample, rotating on collision.
    fn update_best_hap(&self, haps: &[u32], best_hap: &mut [i32], rng: &mut StdRng) {
        let n = haps.len();
        for &hap in haps {
            if hap as usize >= best_hap.len() {
                break; // increasing list: no target haplotypes remain
            }
            let sample = hap >> 1;
            let mut i = rng.gen_range(0..n);
            let mut h = haps[i];
            while (h >> 1) == sample {
                i += 1;
                if i == n {
                    i = 0;
                }
                h = haps[i];
            }
            best_hap[hap as usize] = h as i32;
        }
    }
}

/// IBS source for stage-2 phasing: PBWT neighbours in both directions plus
/// the low-frequency best matches.
pub struct LowFreqPhaseIbs {
    fwd_phase_ibs: PbwtPhaseIbs,
    bwd_phase_ibs: PbwtPhaseIbs,
    fwd_match: Vec<Vec<i32>>,
    bwd_match: Vec<Vec<i32>>,
}

impl LowFreqPhaseIbs {
    pub fn new(pd: &PhaseData<'_>) -> Self {
        let fwd_phase_ibs = PbwtPhaseIbs::new(pd, false);
        let bwd_phase_ibs = PbwtPhaseIbs::new(pd, true);
        let best_match = BestMatch::new(pd);
        let n_steps = pd.coded_steps().n_steps();
        let fwd_match: Vec<Vec<i32>> = (0..n_steps)
            .into_par_iter()
            .map(|step| best_match.fwd_match(step))
            .collect();
        let bwd_match: Vec<Vec<i32>> = (0..n_steps)
            .into_par_iter()
            .map(|step| best_match.bwd_match(step))
            .collect();
        Self {
            fwd_phase_ibs,
            bwd_phase_ibs,
            fwd_match,
            bwd_match,
        }
    }
}

impl IbsHaps for LowFreqPhaseIbs {
    fn add_ibs_haps(&self, hap: u32, step: usize, states: &mut PhaseStates<'_, '_>) {
        self.fwd_phase_ibs.add_ibs_haps(hap, step, states);
        self.bwd_phase_ibs.add_ibs_haps(hap, step, states);
        if self.fwd_match[step][hap as usize] != -1 {
            states.update_fields(self.fwd_match[step][hap as usize] as u32, step);
        }
        if self.bwd_match[step][hap as usize] != -1 {
            states.update_fields(self.bwd_match[step][hap as usize] as u32, step);
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
    use std::sync::Arc;

    /// A panel where samples 0 and 1 share a rare variant at marker 1 and
    /// agree over a long flanking stretch.
    fn build_fpd() -> FixedPhaseData {
        let n_samples = 12;
        let n_markers = 9;
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n_markers {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 200_000,
                Vec::new(),
                vec![Allele::Base(0), Allele::Base(1)],
            ));
        }
        let ids: Vec<String> = (0..n_samples).map(|s| format!("S{}", s)).collect();
        let samples = Arc::new(Samples::from_ids(&ids));
        let recs: Vec<GtRec> = (0..n_markers)
            .map(|m| {
                let mut a1 = vec![0u8; n_samples];
                let mut a2 = vec![0u8; n_samples];
                for s in 0..n_samples {
                    if m == 1 {
                        // rare variant carried only by samples 0 and 1
                        a1[s] = u8::from(s < 2);
                        a2[s] = a1[s];
                    } else {
                        // common variation; samples 0 and 1 stay identical
                        // so their IBS run survives step refinement
                        let key = if s < 2 { 0 } else { s };
                        a1[s] = ((key + m) % 2) as u8;
                        a2[s] = a1[s];
                    }
                }
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
        let mut config = test_config();
        config.rare = 0.2; // carriers with <= 2 samples stay low-frequency
        FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None)
    }

    #[test]
    fn test_rare_variant_match_is_distinct_sample_carrier() {
        let fpd = build_fpd();
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 21);
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 21);
        assert!(fpd.has_low_freq_markers(), "marker 1 must be low-frequency");

        let best_match = BestMatch::new(&pd);
        for step in 0..pd.coded_steps().n_steps() {
            for matches in [best_match.fwd_match(step), best_match.bwd_match(step)] {
                for (hap, &m) in matches.iter().enumerate() {
                    if m >= 0 {
                        // a match always comes from another sample
                        assert_ne!(m as u32 >> 1, (hap as u32) >> 1);
                        // and from the rare-variant carrier set {0, 1}
                        assert!((m as u32 >> 1) < 2, "non-carrier selected");
                        assert!((hap as u32 >> 1) < 2, "match stored for non-carrier");
                    }
                }
            }
        }
    }

    #[test]
    fn test_matches_found_for_carriers() {
        let fpd = build_fpd();
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 22);
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 22);

        let lowfreq = LowFreqPhaseIbs::new(&pd);
        let any_match = lowfreq
            .fwd_match
            .iter()
            .chain(lowfreq.bwd_match.iter())
            .flatten()
            .any(|&m| m >= 0);
        assert!(any_match, "no rare-variant match was ever found");
    }
}

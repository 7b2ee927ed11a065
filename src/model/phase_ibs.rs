//! # PBWT Neighbour Finder
//!
//! Runs Durbin forward or backward sweeps over the coded steps, in
//! parallel batches, and selects for each target haplotype one long-IBS
//! candidate haplotype per step. Candidates from the target's own sample,
//! and candidates IBS2 with the target sample at either endpoint of the
//! step, are excluded.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::model::pbwt::PbwtUpdater;
use crate::model::phase_data::PhaseData;
use crate::model::phase_states::PhaseStates;

/// Candidate-window size during burn-in iterations
const BURNIN_CANDIDATES: usize = 100;

/// Candidate-window size at the end of burn-in
const MAX_PHASE_CANDIDATES: usize = 90;

/// Candidate-window size at the last iteration
const MIN_PHASE_CANDIDATES: usize = 5;

/// A source of per-step IBS haplotypes for the composite state builder
pub trait IbsHaps: Sync {
    /// Push the IBS haplotypes recorded for `hap` at `step` into the
    /// composite state builder.
    fn add_ibs_haps(&self, hap: u32, step: usize, states: &mut PhaseStates<'_, '_>);
}

/// PBWT-selected IBS haplotypes for every (step, target haplotype)
pub struct PbwtPhaseIbs {
    /// Selected haplotype per step and target haplotype (-1 = none)
    ibs_haps: Vec<Vec<i32>>,
}

impl PbwtPhaseIbs {
    /// Run the sweep over all steps.
    ///
    /// `use_bwd` selects the backward sweep; each parallel batch first
    /// processes a buffer of steps outside the batch to warm the
    /// divergence array.
    pub fn new(pd: &PhaseData<'_>, use_bwd: bool) -> Self {
        let coded_steps = pd.coded_steps();
        let n_steps = coded_steps.n_steps();
        let nthreads = pd.config().nthreads();
        let init_n_batches = n_steps.min(nthreads).max(1);
        let steps_per_batch = n_steps / init_n_batches + 1;
        let n_batches = n_steps.div_ceil(steps_per_batch);
        let n_buffer_steps =
            (pd.config().buffer / pd.config().phase_step).round() as usize;

        let batches: Vec<Vec<Vec<i32>>> = (0..n_batches)
            .into_par_iter()
            .map(|batch| {
                if use_bwd {
                    bwd_ibs_haps(pd, batch, n_buffer_steps, steps_per_batch)
                } else {
                    fwd_ibs_haps(pd, batch, n_buffer_steps, steps_per_batch)
                }
            })
            .collect();

        Self {
            ibs_haps: batches.into_iter().flatten().collect(),
        }
    }

    /// The selected haplotype for (step, target hap), or -1
    pub fn ibs_hap(&self, step: usize, hap: u32) -> i32 {
        self.ibs_haps[step][hap as usize]
    }
}

impl IbsHaps for PbwtPhaseIbs {
    fn add_ibs_haps(&self, hap: u32, step: usize, states: &mut PhaseStates<'_, '_>) {
        let ibs_hap = self.ibs_haps[step][hap as usize];
        if ibs_hap >= 0 {
            states.update_fields(ibs_hap as u32, step);
        }
    }
}

/// Candidate-window size for the current iteration: `BURNIN_CANDIDATES`
/// during burn-in, then annealed linearly from `MAX_PHASE_CANDIDATES`
/// down to `MIN_PHASE_CANDIDATES` at the last iteration.
fn n_candidates(pd: &PhaseData<'_>) -> usize {
    let config = pd.config();
    let mut n_candidates = BURNIN_CANDIDATES;
    if pd.it() >= config.burnin {
        let p = pd.n_its_remaining() as f64 / config.iterations as f64;
        n_candidates = (p * MAX_PHASE_CANDIDATES as f64).round() as usize;
        n_candidates = n_candidates.max(MIN_PHASE_CANDIDATES);
    }
    n_candidates.min(pd.n_haps())
}

fn fwd_ibs_haps(
    pd: &PhaseData<'_>,
    batch: usize,
    n_buffer_steps: usize,
    steps_per_batch: usize,
) -> Vec<Vec<i32>> {
    let coded_steps = pd.coded_steps();
    let n_candidates = n_candidates(pd);
    let n_steps = coded_steps.n_steps();
    let start_step = batch * steps_per_batch;
    let end_step = (start_step + steps_per_batch).min(n_steps);
    let buffer_start = start_step.saturating_sub(n_buffer_steps);
    debug_assert!(start_step < n_steps);

    let n_haps = coded_steps.n_haps();
    let mut pbwt = PbwtUpdater::new(n_haps);
    let mut a: Vec<u32> = (0..n_haps as u32).collect();
    let mut d: Vec<i32> = vec![buffer_start as i32; n_haps + 1]; // last entry is the sentinel

    for step in buffer_start..start_step {
        let seqs = coded_steps.get(step);
        pbwt.fwd_update(&seqs.hap_to_seq, seqs.n_seq as usize, step as i32, &mut a, &mut d);
    }
    let mut ibs_haps = Vec::with_capacity(end_step - start_step);
    for step in start_step..end_step {
        let seqs = coded_steps.get(step);
        pbwt.fwd_update(&seqs.hap_to_seq, seqs.n_seq as usize, step as i32, &mut a, &mut d);
        ibs_haps.push(select_ibs_haps(pd, step, &a, &mut d, n_candidates, false));
    }
    ibs_haps
}

fn bwd_ibs_haps(
    pd: &PhaseData<'_>,
    batch: usize,
    n_buffer_steps: usize,
    steps_per_batch: usize,
) -> Vec<Vec<i32>> {
    let coded_steps = pd.coded_steps();
    let n_candidates = n_candidates(pd);
    let n_steps = coded_steps.n_steps();
    let start_step = batch * steps_per_batch;
    let end_step = (start_step + steps_per_batch).min(n_steps);
    let buffer_end = (end_step + n_buffer_steps).min(n_steps);
    debug_assert!(start_step < n_steps);

    let n_haps = coded_steps.n_haps();
    let mut pbwt = PbwtUpdater::new(n_haps);
    let mut a: Vec<u32> = (0..n_haps as u32).collect();
    let mut d: Vec<i32> = vec![buffer_end as i32 - 1; n_haps + 1]; // last entry is the sentinel

    for step in (end_step..buffer_end).rev() {
        let seqs = coded_steps.get(step);
        pbwt.bwd_update(&seqs.hap_to_seq, seqs.n_seq as usize, step as i32, &mut a, &mut d);
    }
    let mut ibs_haps = vec![Vec::new(); end_step - start_step];
    for step in (start_step..end_step).rev() {
        let seqs = coded_steps.get(step);
        pbwt.bwd_update(&seqs.hap_to_seq, seqs.n_seq as usize, step as i32, &mut a, &mut d);
        ibs_haps[step - start_step] = select_ibs_haps(pd, step, &a, &mut d, n_candidates, true);
    }
    ibs_haps
}

/// For each target haplotype, expand the candidate window around its
/// prefix-array position while neighbouring matches still cover the step,
/// then pick one candidate from the window.
fn select_ibs_haps(
    pd: &PhaseData<'_>,
    step: usize,
    a: &[u32],
    d: &mut [i32],
    max_candidates: usize,
    is_bwd: bool,
) -> Vec<i32> {
    let coded_steps = pd.coded_steps();
    let mut rng = StdRng::seed_from_u64(pd.seed().wrapping_add(step as u64));
    let n_targ_haps = coded_steps.n_targ_haps();
    let m_start = coded_steps.step_start(step);
    let m_incl_end = coded_steps.step_end(step) - 1;
    let step_i32 = step as i32;
    let mut selected = vec![-1i32; n_targ_haps];

    // boundary sentinels; the stale values need not be restored
    let sentinel = if is_bwd { step_i32 - 2 } else { step_i32 + 2 };
    d[0] = sentinel;
    d[a.len()] = sentinel;

    for i in 0..a.len() {
        if (a[i] as usize) >= n_targ_haps {
            continue;
        }
        let mut u = i; // inclusive start
        let mut v = i + 1; // exclusive end
        if is_bwd {
            let mut u_match_end = d[u];
            let mut v_match_end = d[v];
            while (v - u) < max_candidates && (step_i32 <= u_match_end || step_i32 <= v_match_end) {
                if u_match_end <= v_match_end {
                    v += 1;
                    v_match_end = d[v].min(v_match_end);
                } else {
                    u -= 1;
                    u_match_end = d[u].min(u_match_end);
                }
            }
        } else {
            let mut u_match_start = d[u];
            let mut v_match_start = d[v];
            while (v - u) < max_candidates
                && (u_match_start <= step_i32 || v_match_start <= step_i32)
            {
                if v_match_start <= u_match_start {
                    v += 1;
                    v_match_start = d[v].max(v_match_start);
                } else {
                    u -= 1;
                    u_match_start = d[u].max(u_match_start);
                }
            }
        }
        selected[a[i] as usize] = pick_match(pd, m_start, m_incl_end, i, u, v, a, &mut rng);
    }
    selected
}

/// Pick a random candidate from `a[u..v)` whose sample is neither the
/// target's own sample nor IBS2 with it at either endpoint of the step.
/// At most `v - u` indices are scanned circularly; -1 if none qualifies.
fn pick_match(
    pd: &PhaseData<'_>,
    m_start: usize,
    m_incl_end: usize,
    i: usize,
    u: usize,
    v: usize,
    a: &[u32],
    rng: &mut StdRng,
) -> i32 {
    let window = v - u;
    if window == 1 {
        return -1;
    }
    let ibs2 = pd.fpd().ibs2();
    let sample = a[i] >> 1;
    let mut index = u + rng.gen_range(0..window);
    for _ in 0..window {
        let sample2 = a[index] >> 1;
        if !ibs2.are_ibs2(sample, sample2, m_start) && !ibs2.are_ibs2(sample, sample2, m_incl_end) {
            return a[index] as i32;
        }
        index += 1;
        if index == v {
            index = u;
        }
    }
    -1
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

    /// Build a PhaseData over phased haplotype rows [hap][marker]
    fn build_fpd(haps: &[Vec<u8>]) -> FixedPhaseData {
        let n_samples = haps.len() / 2;
        let n_markers = haps[0].len();
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
                let a1 = (0..n_samples).map(|s| haps[2 * s][m]).collect();
                let a2 = (0..n_samples).map(|s| haps[2 * s + 1][m]).collect();
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
        let config = test_config();
        FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None)
    }

    #[test]
    fn test_selected_haps_are_ibs_over_the_step() {
        // every selected candidate must carry the target's exact allele
        // sequence across the step it was selected for
        let n_markers = 20;
        let haps: Vec<Vec<u8>> = (0..10u32)
            .map(|h| {
                (0..n_markers)
                    .map(|m| ((h as usize + m) % 3 == 0) as u8)
                    .collect()
            })
            .collect();
        let fpd = build_fpd(&haps);
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 3);
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 3);

        for use_bwd in [false, true] {
            let ibs = PbwtPhaseIbs::new(&pd, use_bwd);
            let mut n_selected = 0usize;
            for step in 0..pd.coded_steps().n_steps() {
                let (start, end) = (pd.coded_steps().step_start(step), pd.coded_steps().step_end(step));
                for hap in 0..10u32 {
                    let sel = ibs.ibs_hap(step, hap);
                    if sel < 0 {
                        continue;
                    }
                    n_selected += 1;
                    for m in start..end {
                        assert_eq!(
                            pd.allele(m, sel as u32),
                            pd.allele(m, hap),
                            "step {} marker {}: selected hap {} disagrees with target {}",
                            step,
                            m,
                            sel,
                            hap
                        );
                    }
                }
            }
            assert!(n_selected > 0, "no IBS candidates were ever selected");
        }
    }

    #[test]
    fn test_self_sample_excluded() {
        let n_markers = 24;
        let haps: Vec<Vec<u8>> = (0..8u32)
            .map(|h| (0..n_markers).map(|m| ((h as usize + m) % 2) as u8).collect())
            .collect();
        let fpd = build_fpd(&haps);
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 5);
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 5);

        for use_bwd in [false, true] {
            let ibs = PbwtPhaseIbs::new(&pd, use_bwd);
            for step in 0..pd.coded_steps().n_steps() {
                for hap in 0..8u32 {
                    let m = ibs.ibs_hap(step, hap);
                    if m >= 0 {
                        assert_ne!(m as u32 >> 1, hap >> 1, "own sample selected");
                    }
                }
            }
        }
    }

    #[test]
    fn test_zero_buffer_is_legal() {
        let n_markers = 16;
        let haps: Vec<Vec<u8>> = (0..6u32)
            .map(|h| (0..n_markers).map(|m| ((h as usize * 3 + m) % 2) as u8).collect())
            .collect();
        let fpd = build_fpd(&haps);
        let mut config = test_config();
        config.buffer = 0.0;
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 7);
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 7);

        // sweeps start cold at batch boundaries and must still complete
        let fwd = PbwtPhaseIbs::new(&pd, false);
        let bwd = PbwtPhaseIbs::new(&pd, true);
        assert_eq!(fwd.ibs_haps.len(), pd.coded_steps().n_steps());
        assert_eq!(bwd.ibs_haps.len(), pd.coded_steps().n_steps());
    }

    #[test]
    fn test_candidate_annealing() {
        let haps: Vec<Vec<u8>> = (0..400u32)
            .map(|h| (0..4).map(|m| ((h + m) % 2) as u8).collect())
            .collect();
        let fpd = build_fpd(&haps);
        let config = test_config();
        let est = EstPhase::new(fpd.hi_freq_targ_gt(), None, 0, 1);

        // burn-in
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, 0, 1);
        assert_eq!(n_candidates(&pd), BURNIN_CANDIDATES);
        // first post-burn-in iteration: ~iterations/iterations * 90
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, config.burnin, 1);
        assert_eq!(n_candidates(&pd), MAX_PHASE_CANDIDATES);
        // final iteration
        let last = config.burnin + config.iterations - 1;
        let pd = PhaseData::new(&fpd, &config, est.haps_gt(), 1.0, last, 1);
        assert_eq!(n_candidates(&pd), (90.0f64 / 12.0).round() as usize);
    }
}

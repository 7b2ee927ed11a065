//! # Stage-1 Phase Update
//!
//! Forward and backward algorithms of the haploid Li-Stephens HMM that
//! decide heterozygote phase at the high-frequency markers. Five forward
//! channels run side by side: a phase-insensitive channel, the two
//! candidate phasings of the current unphased-heterozygote segment, and
//! two channels that impute missing alleles against saved backward
//! vectors. After a full sweep, the lowest-likelihood-ratio heterozygotes
//! remain unphased for the next iteration; the final iteration phases
//! everything.

use crate::data::marker::MarkerIdx;
use crate::model::est_phase::{EstPhase, SampleUpdate};
use crate::model::hmm::HmmUpdater;
use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::IbsHaps;
use crate::model::phase_states::PhaseStates;

/// Forward/backward phasing engine for one worker thread
pub struct PhaseBaum1<'a, 'f> {
    pd: &'a PhaseData<'f>,
    n_markers: usize,
    states: PhaseStates<'a, 'f>,
    hmm: HmmUpdater,
    lr_list: Vec<f32>,

    n_states: usize,
    hap1: Vec<i32>,
    hap2: Vec<i32>,
    ref_al: Vec<Vec<i32>>,
    al_match1: Vec<Vec<u8>>,
    al_match2: Vec<Vec<u8>>,
    fwd: [Vec<f32>; 5],
    bwd: [Vec<f32>; 3],
    sum: [f32; 5],
    saved_bwd1: Vec<Vec<f32>>,
    saved_bwd2: Vec<Vec<f32>>,
    /// All-zero mismatch row: a constant emission that carries no
    /// phase information
    missing_match: Vec<u8>,

    swap_haps: bool,
    saved_index: usize,
    miss_index: usize,
}

impl<'a, 'f> PhaseBaum1<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>) -> Self {
        let n_markers = pd.n_markers();
        let max_states = pd.max_phase_states();
        Self {
            pd,
            n_markers,
            states: PhaseStates::new(pd, max_states),
            hmm: HmmUpdater::new(pd.err()),
            lr_list: Vec::with_capacity(200),
            n_states: 0,
            hap1: vec![0; n_markers],
            hap2: vec![0; n_markers],
            ref_al: Vec::new(),
            al_match1: vec![vec![0u8; max_states]; n_markers],
            al_match2: vec![vec![0u8; max_states]; n_markers],
            fwd: std::array::from_fn(|_| vec![0.0; max_states]),
            bwd: std::array::from_fn(|_| vec![0.0; max_states]),
            sum: [0.0; 5],
            saved_bwd1: Vec::new(),
            saved_bwd2: Vec::new(),
            missing_match: vec![0u8; max_states],
            swap_haps: false,
            saved_index: 0,
            miss_index: 0,
        }
    }

    /// Number of target samples
    pub fn n_targ_samples(&self) -> usize {
        self.pd.phased_targ().samples().len()
    }

    /// Estimate the phased haplotypes for one sample.
    ///
    /// Returns `None` when the sample has neither unphased heterozygotes
    /// nor missing genotypes.
    pub fn phase(&mut self, sample: u32, est: &EstPhase, ibs: &dyn IbsHaps) -> Option<SampleUpdate> {
        self.saved_index = 0;
        self.miss_index = 0;
        self.swap_haps = false;
        let missing = est.missing(sample).clone();
        let unphased = est.unphased(sample).clone();
        if missing.is_empty() && unphased.is_empty() {
            return None;
        }

        self.set_haps_with_missing_alleles(sample, est, &missing, unphased.len());
        self.n_states = self.states.ibs_states(
            ibs,
            sample,
            &self.hap1,
            &self.hap2,
            &mut self.ref_al,
            &mut self.al_match1,
            &mut self.al_match2,
        );

        self.lr_list.clear();
        self.bwd_alg(&unphased);
        self.fwd_alg(&unphased);

        let new_unphased = if unphased.is_empty() {
            None
        } else {
            self.shrink_unphased(&unphased)
        };

        Some(SampleUpdate {
            sample,
            hap1: self.hap1.iter().map(|&a| a as u8).collect(),
            hap2: self.hap2.iter().map(|&a| a as u8).collect(),
            unphased: new_unphased,
        })
    }

    fn set_haps_with_missing_alleles(
        &mut self,
        sample: u32,
        est: &EstPhase,
        missing: &[u32],
        n_unphased: usize,
    ) {
        est.get_haps_i32(sample, &mut self.hap1, &mut self.hap2);
        for &m in missing {
            self.hap1[m as usize] = -1;
            self.hap2[m as usize] = -1;
        }
        let max_states = self.states.max_states();
        while self.ref_al.len() < missing.len() {
            self.ref_al.push(vec![0; max_states]);
        }
        let n_saved = missing.len() + n_unphased;
        while self.saved_bwd1.len() < n_saved {
            self.saved_bwd1.push(vec![0.0; max_states]);
            self.saved_bwd2.push(vec![0.0; max_states]);
        }
    }

    // ------------------------------------------------------------------
    // backward sweep
    // ------------------------------------------------------------------

    /// Backward pass saving `bwd1`/`bwd2` at every unphased-heterozygote
    /// marker and at every missing-allele marker.
    fn bwd_alg(&mut self, unphased: &[u32]) {
        let n_states = self.n_states;
        let mut end = self.n_markers - 1;
        let init = 1.0 / n_states as f32;
        self.bwd[0][..n_states].fill(init);
        if self.hap1[end] < 0 || self.hap2[end] < 0 {
            self.saved_bwd1[self.saved_index][..n_states].fill(init);
            self.saved_bwd2[self.saved_index][..n_states].fill(init);
            self.saved_index += 1;
        }
        for j in (0..unphased.len()).rev() {
            debug_assert!(unphased[j] > 0, "the anchor heterozygote is never unphased");
            let start = unphased[j] as usize - 1;
            self.run_bwd(start, end);
            self.saved_bwd1[self.saved_index][..n_states].copy_from_slice(&self.bwd[1][..n_states]);
            self.saved_bwd2[self.saved_index][..n_states].copy_from_slice(&self.bwd[2][..n_states]);
            self.saved_index += 1;
            end = start;
        }
        self.run_bwd(0, end);
    }

    fn run_bwd(&mut self, start: usize, end: usize) {
        let n_states = self.n_states;
        let [b0, b1, b2] = &mut self.bwd;
        b1[..n_states].copy_from_slice(&b0[..n_states]);
        b2[..n_states].copy_from_slice(&b0[..n_states]);
        for m in (start..end).rev() {
            let m_p1 = m + 1;
            let p_rec = self.pd.p_recomb(m_p1);
            let flat_emission =
                self.hap1[m_p1] < 0 || self.hap2[m_p1] < 0 || self.hap1[m_p1] != self.hap2[m_p1];
            let al_match0: &[u8] = if flat_emission {
                &self.missing_match
            } else {
                &self.al_match1[m_p1]
            };
            self.hmm.bwd_update(b0, p_rec, al_match0, n_states);
            self.hmm.bwd_update(b1, p_rec, &self.al_match1[m_p1], n_states);
            self.hmm.bwd_update(b2, p_rec, &self.al_match2[m_p1], n_states);
            if self.hap1[m] < 0 || self.hap2[m] < 0 {
                self.saved_bwd1[self.saved_index][..n_states].copy_from_slice(&b1[..n_states]);
                self.saved_bwd2[self.saved_index][..n_states].copy_from_slice(&b2[..n_states]);
                self.saved_index += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // forward sweep
    // ------------------------------------------------------------------

    /// Forward pass advancing segment by segment between unphased
    /// heterozygotes; saved backward vectors are consumed in reverse save
    /// order, which is forward marker order.
    fn fwd_alg(&mut self, unphased: &[u32]) {
        let n_states = self.n_states;
        let init = 1.0 / n_states as f32;
        self.fwd[0][..n_states].fill(init);
        self.fwd[3][..n_states].fill(init);
        self.fwd[4][..n_states].fill(init);
        self.sum[0] = 1.0;
        self.sum[3] = 1.0;
        self.sum[4] = 1.0;
        let mut start = 0usize;
        for &unph in unphased {
            let end = unph as usize;
            self.set_fwd(start, end);
            self.phase_het();
            start = end;
        }
        self.set_fwd(start, self.n_markers);
    }

    fn set_fwd(&mut self, start: usize, end: usize) {
        if self.swap_haps {
            self.swap_hap_range(start, end);
        }
        let n_states = self.n_states;
        {
            let (f0, rest) = self.fwd.split_first_mut().expect("channel array");
            rest[0][..n_states].copy_from_slice(&f0[..n_states]);
            rest[1][..n_states].copy_from_slice(&f0[..n_states]);
        }
        self.sum[1] = self.sum[0];
        self.sum[2] = self.sum[0];

        for m in start..end {
            let p_rec = self.pd.p_recomb(m);
            let is_missing = self.hap1[m] < 0 || self.hap2[m] < 0;
            let flat_emission = is_missing || self.hap1[m] != self.hap2[m];
            {
                let al_match0: &[u8] = if flat_emission {
                    &self.missing_match
                } else {
                    &self.al_match1[m]
                };
                self.sum[0] =
                    self.hmm
                        .fwd_update(&mut self.fwd[0], self.sum[0], p_rec, al_match0, n_states);
            }
            self.sum[1] = self.hmm.fwd_update(
                &mut self.fwd[1],
                self.sum[1],
                p_rec,
                &self.al_match1[m],
                n_states,
            );
            self.sum[2] = self.hmm.fwd_update(
                &mut self.fwd[2],
                self.sum[2],
                p_rec,
                &self.al_match2[m],
                n_states,
            );
            self.sum[3] = self.hmm.fwd_update(
                &mut self.fwd[3],
                self.sum[3],
                p_rec,
                &self.al_match1[m],
                n_states,
            );
            self.sum[4] = self.hmm.fwd_update(
                &mut self.fwd[4],
                self.sum[4],
                p_rec,
                &self.al_match2[m],
                n_states,
            );

            if is_missing {
                let n_alleles = self
                    .pd
                    .phased_targ()
                    .markers()
                    .marker(MarkerIdx::new(m as u32))
                    .n_alleles();
                self.saved_index -= 1;
                let bwd1 = &self.saved_bwd1[self.saved_index];
                let bwd2 = &self.saved_bwd2[self.saved_index];
                let ref_alleles = &self.ref_al[self.miss_index];
                self.miss_index += 1;
                let (bwd_for_h1, bwd_for_h2) = if self.swap_haps {
                    (bwd2, bwd1)
                } else {
                    (bwd1, bwd2)
                };
                self.hap1[m] =
                    impute_allele(n_alleles, n_states, ref_alleles, &self.fwd[3], bwd_for_h1);
                self.hap2[m] =
                    impute_allele(n_alleles, n_states, ref_alleles, &self.fwd[4], bwd_for_h2);
            }
        }
    }

    /// Decide the ordering of the heterozygote segment just finished
    fn phase_het(&mut self) {
        let n_states = self.n_states;
        self.saved_index -= 1;
        let b1 = &self.saved_bwd1[self.saved_index];
        let b2 = &self.saved_bwd2[self.saved_index];
        let mut p11 = 0.0f32;
        let mut p12 = 0.0f32;
        let mut p21 = 0.0f32;
        let mut p22 = 0.0f32;
        for k in 0..n_states {
            p11 += self.fwd[1][k] * b1[k];
            p12 += self.fwd[1][k] * b2[k];
            p21 += self.fwd[2][k] * b1[k];
            p22 += self.fwd[2][k] * b2[k];
        }
        let num = p11 * p22;
        let den = p12 * p21;
        self.swap_haps = num < den;
        self.lr_list
            .push(if self.swap_haps { den / num } else { num / den });
    }

    /// Exchange the haplotypes (and their mismatch channels) on a segment
    fn swap_hap_range(&mut self, m1: usize, m2: usize) {
        for m in m1..m2 {
            let tmp = self.hap1[m];
            self.hap1[m] = self.hap2[m];
            self.hap2[m] = tmp;
            std::mem::swap(&mut self.al_match1[m], &mut self.al_match2[m]);
        }
    }

    /// Keep the lowest-likelihood-ratio heterozygotes unphased
    fn shrink_unphased(&self, prev_unphased: &[u32]) -> Option<Vec<u32>> {
        let prop = self.pd.leave_unphased_prop(prev_unphased.len());
        if prop >= 1.0 {
            return None;
        }
        let threshold = lr_threshold(&self.lr_list, prop);
        let next: Vec<u32> = prev_unphased
            .iter()
            .zip(self.lr_list.iter())
            .filter(|(_, &lr)| lr < threshold)
            .map(|(&m, _)| m)
            .collect();
        Some(next)
    }
}

/// Posterior argmax allele over the state alleles
fn impute_allele(
    n_alleles: usize,
    n_states: usize,
    ref_al: &[i32],
    fwd: &[f32],
    bwd: &[f32],
) -> i32 {
    let mut al_freq = vec![0.0f32; n_alleles];
    for k in 0..n_states {
        al_freq[ref_al[k] as usize] += fwd[k] * bwd[k];
    }
    let mut max_index = 0;
    for j in 1..al_freq.len() {
        if al_freq[j] > al_freq[max_index] {
            max_index = j;
        }
    }
    max_index as i32
}

/// The likelihood-ratio value below which a heterozygote stays unphased
fn lr_threshold(lr_list: &[f32], prop_to_leave_unphased: f64) -> f32 {
    let mut lra = lr_list.to_vec();
    lra.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (prop_to_leave_unphased * lra.len() as f64 + 0.5).floor() as usize;
    lra[rank.min(lra.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impute_allele_argmax() {
        let ref_al = vec![0, 1, 1, 0];
        let fwd = vec![0.1, 0.4, 0.3, 0.1];
        let bwd = vec![0.25, 0.25, 0.25, 0.25];
        // allele 1 carries 0.7 of the mass
        assert_eq!(impute_allele(2, 4, &ref_al, &fwd, &bwd), 1);
    }

    #[test]
    fn test_lr_threshold_bounds() {
        let lrs = vec![1.5, 9.0, 2.5, 4.0];
        // leave nothing unphased: threshold is the smallest ratio and the
        // strict comparison keeps nothing
        assert_eq!(lr_threshold(&lrs, 0.0), 1.5);
        // leave everything: threshold clamps to the largest ratio
        assert_eq!(lr_threshold(&lrs, 1.0), 9.0);
        // leave half
        assert_eq!(lr_threshold(&lrs, 0.5), 4.0);
    }
}

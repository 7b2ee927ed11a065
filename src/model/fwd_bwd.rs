//! # Stage-2 State Probabilities
//!
//! Forward/backward computation of posterior state probabilities for a
//! single target haplotype at every high-frequency marker, with the
//! composite reference haplotype of each state recorded per marker. Used
//! by stage-2 completion to interpolate posteriors at low-frequency and
//! missing sites.

use crate::model::hmm::HmmUpdater;
use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::IbsHaps;
use crate::model::phase_states::PhaseStates;

/// Forward/backward engine for one worker thread
pub struct FwdBwd<'a, 'f> {
    pd: &'a PhaseData<'f>,
    max_states: usize,
    states: PhaseStates<'a, 'f>,
    hmm: HmmUpdater,
    n_mismatches: Vec<Vec<u8>>,
    bwd: Vec<f32>,
}

impl<'a, 'f> FwdBwd<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>) -> Self {
        let n_markers = pd.n_markers();
        // the state-probability pass runs with half the phasing states
        let max_states = (pd.max_phase_states() / 2).max(1);
        Self {
            pd,
            max_states,
            states: PhaseStates::new(pd, max_states),
            hmm: HmmUpdater::new(pd.err()),
            n_mismatches: vec![vec![0u8; max_states]; n_markers],
            bwd: vec![0.0; max_states],
        }
    }

    /// Maximum number of HMM states
    pub fn max_states(&self) -> usize {
        self.max_states
    }

    /// Compute the per-marker reference haplotypes and posterior state
    /// probabilities of the target haplotype. Each row of `ref_haps` and
    /// `state_probs` must hold at least `max_states()` entries. Returns
    /// the number of states.
    pub fn run(
        &mut self,
        hap: u32,
        ibs: &dyn IbsHaps,
        ref_haps: &mut [Vec<u32>],
        state_probs: &mut [Vec<f32>],
    ) -> usize {
        let n_states = self
            .states
            .ibs_states_hap(ibs, hap, ref_haps, &mut self.n_mismatches);
        self.run_fwd(state_probs, n_states);
        self.run_bwd(state_probs, n_states);
        n_states
    }

    fn run_fwd(&mut self, state_probs: &mut [Vec<f32>], n_states: usize) {
        let mut last_sum = 0.0f32;
        for j in 0..n_states {
            state_probs[0][j] = self.hmm.emit(self.n_mismatches[0][j]);
            last_sum += state_probs[0][j];
        }
        for m in 1..state_probs.len() {
            let m_m1 = m - 1;
            let p_rec = self.pd.p_recomb(m);
            let shift = p_rec / n_states as f32;
            let scale = (1.0 - p_rec) / last_sum;
            last_sum = 0.0;
            for j in 0..n_states {
                let em = self.hmm.emit(self.n_mismatches[m][j]);
                state_probs[m][j] = em * (scale * state_probs[m_m1][j] + shift);
                last_sum += state_probs[m][j];
            }
        }
    }

    fn run_bwd(&mut self, state_probs: &mut [Vec<f32>], n_states: usize) {
        let incl_end = state_probs.len() - 1;
        self.bwd[..n_states].fill(1.0 / n_states as f32);
        for m in (0..incl_end).rev() {
            let m_p1 = m + 1;
            let mut sum = 0.0f32;
            for j in 0..n_states {
                self.bwd[j] *= self.hmm.emit(self.n_mismatches[m_p1][j]);
                sum += self.bwd[j];
            }
            let p_rec = self.pd.p_recomb(m_p1);
            let scale = (1.0 - p_rec) / sum;
            let shift = p_rec / n_states as f32;
            let mut post_sum = 0.0f32;
            for j in 0..n_states {
                self.bwd[j] = scale * self.bwd[j] + shift;
                state_probs[m][j] *= self.bwd[j];
                post_sum += state_probs[m][j];
            }
            for j in 0..n_states {
                state_probs[m][j] /= post_sum;
            }
        }
    }
}

//! # Per-Iteration Phase Data
//!
//! The inputs of one phasing iteration: a snapshot of the current phased
//! target haplotypes, the coded steps built from that snapshot, and the
//! per-marker recombination probabilities derived from the current
//! recombination factor.

use crate::config::Config;
use crate::data::gt::HapsGt;
use crate::data::marker::MarkerIdx;
use crate::model::coded_steps::CodedSteps;
use crate::model::fixed_phase_data::FixedPhaseData;

/// Thread-shared input data for one phase update
pub struct PhaseData<'f> {
    fpd: &'f FixedPhaseData,
    config: &'f Config,
    phased_targ: HapsGt,
    coded_steps: CodedSteps,
    n_targ_haps: usize,
    n_haps: usize,
    err: f32,
    recomb_factor: f32,
    p_recomb: Vec<f32>,
    it: usize,
    n_its_remaining: usize,
    seed: u64,
}

impl<'f> PhaseData<'f> {
    /// Assemble the data for iteration `it`.
    ///
    /// `phased_targ` must be a snapshot of the estimated phase over the
    /// high-frequency markers.
    pub fn new(
        fpd: &'f FixedPhaseData,
        config: &'f Config,
        phased_targ: HapsGt,
        recomb_factor: f32,
        it: usize,
        seed: u64,
    ) -> Self {
        assert!(
            recomb_factor >= 0.0 && recomb_factor.is_finite(),
            "invalid recombination factor {}",
            recomb_factor
        );
        let total_its = config.burnin + config.iterations;
        assert!(it <= total_its, "iteration out of range");

        let coded_steps = CodedSteps::new(
            &phased_targ,
            fpd.hi_freq_ref_gt(),
            fpd.hi_freq_map(),
            config.phase_step,
            config.scale_factor(),
            seed,
        );
        let p_recomb = fpd.hi_freq_map().p_recomb(recomb_factor);

        Self {
            fpd,
            config,
            n_targ_haps: phased_targ.n_haps(),
            phased_targ,
            coded_steps,
            n_haps: fpd.n_haps(),
            err: fpd.err(),
            recomb_factor,
            p_recomb,
            it,
            n_its_remaining: total_its - it,
            seed,
        }
    }

    /// The window-fixed phasing input
    pub fn fpd(&self) -> &'f FixedPhaseData {
        self.fpd
    }

    /// The analysis parameters
    pub fn config(&self) -> &'f Config {
        self.config
    }

    /// The phased-haplotype snapshot over high-frequency markers
    pub fn phased_targ(&self) -> &HapsGt {
        &self.phased_targ
    }

    /// The coded steps built from the snapshot
    pub fn coded_steps(&self) -> &CodedSteps {
        &self.coded_steps
    }

    /// Number of high-frequency markers
    pub fn n_markers(&self) -> usize {
        self.phased_targ.n_markers()
    }

    /// Number of target haplotypes
    pub fn n_targ_haps(&self) -> usize {
        self.n_targ_haps
    }

    /// Total number of target and reference haplotypes
    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    /// Allele mismatch probability
    pub fn err(&self) -> f32 {
        self.err
    }

    /// Allele of a haplotype at a high-frequency marker; reference
    /// haplotypes follow the target haplotypes.
    #[inline]
    pub fn allele(&self, m: usize, hap: u32) -> u8 {
        let idx = MarkerIdx::new(m as u32);
        if (hap as usize) < self.n_targ_haps {
            self.phased_targ
                .allele(idx, crate::data::haplotype::HapIdx(hap))
        } else {
            self.fpd
                .hi_freq_ref_gt()
                .expect("haplotype index beyond target range without reference")
                .allele(
                    idx,
                    crate::data::haplotype::HapIdx(hap - self.n_targ_haps as u32),
                )
        }
    }

    /// Probability of transitioning to a random state before marker `m`
    #[inline]
    pub fn p_recomb(&self, m: usize) -> f32 {
        self.p_recomb[m]
    }

    /// Genetic distance between high-frequency markers `m` and `m-1`
    pub fn gen_dist(&self, m: MarkerIdx) -> f64 {
        self.fpd.hi_freq_map().gen_dist(m)
    }

    /// The current recombination factor
    pub fn recomb_factor(&self) -> f32 {
        self.recomb_factor
    }

    /// Update the recombination factor (between the regression and the
    /// phase update of an iteration).
    pub fn set_recomb_factor(&mut self, recomb_factor: f32) {
        assert!(
            recomb_factor >= 0.0 && recomb_factor.is_finite(),
            "invalid recombination factor {}",
            recomb_factor
        );
        self.recomb_factor = recomb_factor;
        self.p_recomb = self.fpd.hi_freq_map().p_recomb(recomb_factor);
    }

    /// Current 0-based iteration
    pub fn it(&self) -> usize {
        self.it
    }

    /// Iterations remaining including this one
    pub fn n_its_remaining(&self) -> usize {
        self.n_its_remaining
    }

    /// Random seed for this iteration
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Maximum number of composite states in the phasing HMM
    pub fn max_phase_states(&self) -> usize {
        self.config.phase_states
    }

    /// Composite-state recycling threshold in steps
    pub fn min_steps(&self) -> usize {
        let default_min_steps = 200.0;
        (default_min_steps * self.config.scale_factor() as f64).ceil() as usize
    }

    /// Proportion of still-ambiguous heterozygotes to leave unphased at
    /// the end of this iteration for a sample with `n_unphased` remaining
    /// unphased heterozygotes.
    pub fn leave_unphased_prop(&self, n_unphased: usize) -> f64 {
        if self.it < self.config.burnin {
            1.0
        } else if self.n_its_remaining == 1 {
            0.0
        } else {
            (n_unphased as f64).powf(-1.0 / self.n_its_remaining as f64)
        }
    }
}

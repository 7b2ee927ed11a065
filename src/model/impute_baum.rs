//! # Stage-2 Haplotype Completion
//!
//! Runs the forward/backward HMM over the phased high-frequency
//! haplotypes of each target haplotype, then phases heterozygotes and
//! imputes missing alleles at the low-frequency markers by linear
//! interpolation of the flanking high-frequency state posteriors.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::gt::{RefGt, TargGt};
use crate::data::haplotype::{HapIdx, SampleIdx};
use crate::data::marker::{MarkerIdx, MISSING_ALLELE};
use crate::model::fwd_bwd::FwdBwd;
use crate::model::hap_imputer::PartlyImputedAllele;
use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::IbsHaps;

/// Stage-2 output for one sample
pub struct SampleImputation {
    pub sample: u32,
    pub hap1: Vec<u8>,
    pub hap2: Vec<u8>,
    /// Partially-imputed alleles of the two haplotypes
    pub partly: [Vec<PartlyImputedAllele>; 2],
}

/// Stage-2 completion engine for one worker thread
pub struct ImputeBaum<'a, 'f> {
    pd: &'a PhaseData<'f>,
    fwd_bwd: FwdBwd<'a, 'f>,
    /// Per haplotype bit: composite reference haplotypes [marker][state]
    states: [Vec<Vec<u32>>; 2],
    /// Per haplotype bit: posterior state probabilities [marker][state]
    probs: [Vec<Vec<f32>>; 2],
    n_states: [usize; 2],
    targ_hap: [u32; 2],

    n_targ_haps: usize,
    n_hi_freq_markers: usize,
    n_all_markers: usize,
    out_phase: [Vec<u8>; 2],
    partly: [Vec<PartlyImputedAllele>; 2],
    saved_states: Vec<u32>,
    saved_probs: Vec<f32>,
}

impl<'a, 'f> ImputeBaum<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>) -> Self {
        let fwd_bwd = FwdBwd::new(pd);
        let max_states = fwd_bwd.max_states();
        let n_hi_freq_markers = pd.n_markers();
        let n_all_markers = pd.fpd().targ_gt().n_markers();
        Self {
            pd,
            fwd_bwd,
            states: std::array::from_fn(|_| {
                vec![vec![0u32; max_states]; n_hi_freq_markers]
            }),
            probs: std::array::from_fn(|_| {
                vec![vec![0.0f32; max_states]; n_hi_freq_markers]
            }),
            n_states: [0; 2],
            targ_hap: [0; 2],
            n_targ_haps: pd.n_targ_haps(),
            n_hi_freq_markers,
            n_all_markers,
            out_phase: std::array::from_fn(|_| vec![0u8; n_all_markers]),
            partly: std::array::from_fn(|_| Vec::new()),
            saved_states: Vec::with_capacity(8),
            saved_probs: Vec::with_capacity(8),
        }
    }

    /// Phase and impute all markers for one sample
    pub fn phase(&mut self, sample: u32, ibs: &dyn IbsHaps) -> SampleImputation {
        let mut rng = StdRng::seed_from_u64(self.pd.seed().wrapping_add(sample as u64));
        self.partly = std::array::from_fn(|_| Vec::new());
        for i in 0..2 {
            self.targ_hap[i] = (sample << 1) + i as u32;
            self.n_states[i] = self.fwd_bwd.run(
                self.targ_hap[i],
                ibs,
                &mut self.states[i],
                &mut self.probs[i],
            );
        }

        let hi_freq = self.pd.fpd().hi_freq_indices().clone();
        let phased = self.pd.phased_targ();
        let s = SampleIdx::new(sample);
        let mut start = 0usize;
        for (j, &end) in hi_freq.iter().enumerate() {
            let end = end as usize;
            self.impute_interval(sample, start, end, &mut rng);
            let idx = MarkerIdx::new(j as u32);
            self.out_phase[0][end] = phased.allele(idx, s.hap1());
            self.out_phase[1][end] = phased.allele(idx, s.hap2());
            start = end + 1;
        }
        self.impute_interval(sample, start, self.n_all_markers, &mut rng);

        SampleImputation {
            sample,
            hap1: self.out_phase[0].clone(),
            hap2: self.out_phase[1].clone(),
            partly: std::mem::take(&mut self.partly),
        }
    }

    fn impute_interval(&mut self, sample: u32, start: usize, end: usize, rng: &mut StdRng) {
        let unph_targ = self.pd.fpd().targ_gt();
        let s = SampleIdx::new(sample);
        for m in start..end {
            let idx = MarkerIdx::new(m as u32);
            let a1 = unph_targ.allele1(idx, s);
            let a2 = unph_targ.allele2(idx, s);
            if a1 != MISSING_ALLELE && a2 != MISSING_ALLELE {
                let mut no_flip = true;
                if a1 != a2 {
                    let al_probs1 = self.unscaled_al_probs(m, 0, a1, a2);
                    let al_probs2 = self.unscaled_al_probs(m, 1, a1, a2);
                    let p1 = al_probs1[a1 as usize] * al_probs2[a2 as usize];
                    let p2 = al_probs1[a2 as usize] * al_probs2[a1 as usize];
                    no_flip = p1 > p2 || (p1 == 0.0 && p2 == 0.0 && rng.gen::<bool>());
                }
                self.out_phase[0][m] = if no_flip { a1 } else { a2 };
                self.out_phase[1][m] = if no_flip { a2 } else { a1 };
            } else {
                self.out_phase[0][m] = self.impute_allele(m, 0);
                self.out_phase[1][m] = self.impute_allele(m, 1);
            }
        }
    }

    /// Interpolated posterior allele probabilities for phasing an observed
    /// heterozygote: only states carrying an allele of the genotype as a
    /// rare variant (or homozygous states) contribute.
    fn unscaled_al_probs(&self, m: usize, hap_bit: usize, a1: u8, a2: u8) -> Vec<f32> {
        let fpd = self.pd.fpd();
        let idx = MarkerIdx::new(m as u32);
        let n_alleles = fpd.targ_gt().markers().marker(idx).n_alleles();
        let mut al_probs = vec![0.0f32; n_alleles];
        let rare1 = fpd.is_low_freq(m, a1);
        let rare2 = fpd.is_low_freq(m, a2);
        let mkr_a = fpd.prev_hi_freq_marker(m);
        let mkr_b = (mkr_a + 1).min(self.n_hi_freq_markers - 1);
        let states_a = &self.states[hap_bit][mkr_a];
        let probs_a = &self.probs[hap_bit][mkr_a];
        let probs_b = &self.probs[hap_bit][mkr_b];
        let wt = fpd.prev_wt(m);

        for j in 0..self.n_states[hap_bit] {
            let hap = states_a[j];
            let b1 = self.allele(m, hap);
            let b2 = self.allele(m, hap ^ 1);
            if b1 == MISSING_ALLELE || b2 == MISSING_ALLELE {
                continue;
            }
            let prob = wt * probs_a[j] + (1.0 - wt) * probs_b[j];
            if b1 == b2 {
                al_probs[b1 as usize] += prob;
            } else {
                let match1 = rare1 && (a1 == b1 || a1 == b2);
                let match2 = rare2 && (a2 == b1 || a2 == b2);
                if match1 ^ match2 {
                    let al = if match1 { a1 } else { a2 };
                    al_probs[al as usize] += prob;
                }
            }
        }
        al_probs
    }

    /// Impute a missing allele from the interpolated posteriors. States
    /// whose haplotype allele is undetermined (target heterozygotes)
    /// accumulate into the unknown bucket; if the unknown mass dominates,
    /// the allele is finished in a second pass against the final panel.
    fn impute_allele(&mut self, m: usize, hap_bit: usize) -> u8 {
        self.saved_states.clear();
        self.saved_probs.clear();
        let fpd = self.pd.fpd();
        let idx = MarkerIdx::new(m as u32);
        let n_alleles = fpd.targ_gt().markers().marker(idx).n_alleles();
        let mut al_probs = vec![0.0f32; n_alleles];
        let mut unknown_al_prob = 0.0f32;
        let mkr_a = fpd.prev_hi_freq_marker(m);
        let mkr_b = (mkr_a + 1).min(self.n_hi_freq_markers - 1);
        let states_a = &self.states[hap_bit][mkr_a];
        let probs_a = &self.probs[hap_bit][mkr_a];
        let probs_b = &self.probs[hap_bit][mkr_b];
        let wt = fpd.prev_wt(m);

        for j in 0..self.n_states[hap_bit] {
            let prob = wt * probs_a[j] + (1.0 - wt) * probs_b[j];
            let hap = states_a[j];
            if hap as usize >= self.n_targ_haps {
                // reference haplotypes are phased: their allele is known
                al_probs[self.allele(m, hap) as usize] += prob;
                continue;
            }
            let b1 = self.allele(m, hap);
            let b2 = self.allele(m, hap ^ 1);
            if b1 == MISSING_ALLELE || b2 == MISSING_ALLELE {
                continue;
            }
            if b1 == b2 {
                al_probs[b1 as usize] += prob;
            } else {
                unknown_al_prob += prob;
                self.saved_states.push(hap);
                self.saved_probs.push(prob);
            }
        }

        let mut imputed = 0usize;
        for j in 1..al_probs.len() {
            if al_probs[j] > al_probs[imputed] {
                imputed = j;
            }
        }
        if al_probs[imputed] < unknown_al_prob {
            self.partly[hap_bit].push(PartlyImputedAllele::new(
                m as u32,
                al_probs,
                self.saved_states.clone(),
                self.saved_probs.clone(),
            ));
        }
        imputed as u8
    }

    /// Allele carried by a haplotype at an all-marker-space marker; target
    /// haplotypes read the unphased input genotypes, reference haplotypes
    /// follow with shifted indices.
    fn allele(&self, m: usize, hap: u32) -> u8 {
        let idx = MarkerIdx::new(m as u32);
        if (hap as usize) < self.n_targ_haps {
            self.unph_targ().allele(idx, HapIdx::new(hap))
        } else {
            self.ref_gt()
                .expect("haplotype index beyond target range without reference")
                .allele(idx, HapIdx::new(hap - self.n_targ_haps as u32))
        }
    }

    fn unph_targ(&self) -> &TargGt {
        self.pd.fpd().targ_gt()
    }

    fn ref_gt(&self) -> Option<&RefGt> {
        self.pd.fpd().ref_gt()
    }
}

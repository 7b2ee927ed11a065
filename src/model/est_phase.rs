//! # Estimated Phase State
//!
//! Per-sample working state of the phasing iterations: the current
//! haplotype pair as packed allele bits, the list of remaining unphased
//! heterozygote markers, and the list of missing-genotype markers.
//!
//! Worker tasks read a start-of-iteration snapshot; their updates are
//! applied by the driver after each iteration barrier, so the unphased
//! list can only shrink and readers always see consistent state.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;

use crate::data::gt::{HapsGt, RefGt, TargGt};
use crate::data::haplotype::{HapIdx, SampleIdx};
use crate::data::marker::{Markers, MarkerIdx, PackedAlleles, MISSING_ALLELE};

/// Imputes alleles by sampling from marker allele frequencies.
///
/// Frequencies are estimated from at most `MAX_FREQ_HAPS` randomly chosen
/// haplotypes, target haplotypes first.
pub struct AlleleImputer {
    al_freq: Vec<Vec<f64>>,
}

const MAX_FREQ_HAPS: usize = 2000;

impl AlleleImputer {
    pub fn new(targ: &TargGt, ref_gt: Option<&RefGt>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let targ_haps = hap_indices(targ.n_haps(), MAX_FREQ_HAPS, &mut rng);
        let n_ref_haps = ref_gt.map_or(0, |r| r.n_haps());
        let ref_haps = hap_indices(
            n_ref_haps,
            MAX_FREQ_HAPS.saturating_sub(targ_haps.len()),
            &mut rng,
        );

        let al_freq = (0..targ.n_markers())
            .into_par_iter()
            .map(|m| {
                let idx = MarkerIdx::new(m as u32);
                let n_alleles = targ.markers().marker(idx).n_alleles();
                let mut cnts = vec![0usize; n_alleles];
                for &h in &targ_haps {
                    let allele = targ.allele(idx, HapIdx::new(h));
                    if allele != MISSING_ALLELE {
                        cnts[allele as usize] += 1;
                    }
                }
                if let Some(r) = ref_gt {
                    for &h in &ref_haps {
                        cnts[r.allele(idx, HapIdx::new(h)) as usize] += 1;
                    }
                }
                let sum: usize = cnts.iter().sum();
                if sum > 0 {
                    cnts.iter().map(|&c| c as f64 / sum as f64).collect()
                } else {
                    let mut freq = vec![0.0; n_alleles];
                    freq[0] = 1.0;
                    freq
                }
            })
            .collect();
        Self { al_freq }
    }

    pub fn n_markers(&self) -> usize {
        self.al_freq.len()
    }

    /// Draw an allele for the marker from its frequency distribution
    pub fn impute_allele(&self, marker: usize, rng: &mut StdRng) -> u8 {
        let freq = &self.al_freq[marker];
        let d: f64 = rng.gen();
        let mut sum = 0.0;
        for (al, &f) in freq.iter().enumerate() {
            sum += f;
            if sum >= d {
                return al as u8;
            }
        }
        (freq.len() - 1) as u8
    }
}

fn hap_indices(n_haps: usize, max_haps: usize, rng: &mut StdRng) -> Vec<u32> {
    if n_haps == 0 || max_haps == 0 {
        return Vec::new();
    }
    let mut indices: Vec<u32> = (0..n_haps as u32).collect();
    if max_haps < indices.len() {
        use rand::seq::SliceRandom;
        let (chosen, _) = indices.partial_shuffle(rng, max_haps);
        let mut chosen = chosen.to_vec();
        chosen.sort_unstable();
        return chosen;
    }
    indices.sort_unstable();
    indices
}

/// One sample's phase update produced by a worker task
pub struct SampleUpdate {
    pub sample: u32,
    pub hap1: Vec<u8>,
    pub hap2: Vec<u8>,
    /// The shrunken unphased-heterozygote list, when it changed
    pub unphased: Option<Vec<u32>>,
}

/// Mutable working phase state for all target samples
pub struct EstPhase {
    markers: Arc<Markers>,
    samples: Arc<crate::data::haplotype::Samples>,
    haps: Vec<Arc<PackedAlleles>>,
    unphased: Vec<Arc<[u32]>>,
    missing: Vec<Arc<[u32]>>,
}

impl EstPhase {
    /// Initialise from unphased target genotypes.
    ///
    /// The first `overlap` markers must be phased and non-missing (they
    /// come from the previous window); heterozygotes after the overlap are
    /// randomly ordered and missing alleles drawn from allele frequencies.
    /// The first heterozygote after an overlap without any het anchors the
    /// sample's phase and is not listed as unphased.
    pub fn new(targ: &TargGt, ref_gt: Option<&RefGt>, overlap: usize, seed: u64) -> Self {
        let n_markers = targ.n_markers();
        let n_samples = targ.n_samples();
        let imputer = AlleleImputer::new(targ, ref_gt, seed);
        let markers = Arc::new(targ.markers().clone());

        let per_sample: Vec<(Arc<PackedAlleles>, Arc<PackedAlleles>, Arc<[u32]>, Arc<[u32]>)> =
            (0..n_samples)
                .into_par_iter()
                .map(|s| {
                    let sample = SampleIdx::new(s as u32);
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(s as u64));
                    let mut hap1 = vec![0u8; n_markers];
                    let mut hap2 = vec![0u8; n_markers];
                    let mut unphased = Vec::new();
                    let mut missing = Vec::new();

                    let mut found_first_het = false;
                    for m in 0..overlap {
                        let idx = MarkerIdx::new(m as u32);
                        let a1 = targ.allele1(idx, sample);
                        let a2 = targ.allele2(idx, sample);
                        assert!(
                            a1 != MISSING_ALLELE && a2 != MISSING_ALLELE,
                            "missing genotype in phased overlap"
                        );
                        found_first_het |= a1 != a2;
                        hap1[m] = a1;
                        hap2[m] = a2;
                    }
                    for m in overlap..n_markers {
                        let idx = MarkerIdx::new(m as u32);
                        let mut a1 = targ.allele1(idx, sample);
                        let mut a2 = targ.allele2(idx, sample);
                        if a1 == MISSING_ALLELE || a2 == MISSING_ALLELE {
                            missing.push(m as u32);
                            a1 = imputer.impute_allele(m, &mut rng);
                            a2 = imputer.impute_allele(m, &mut rng);
                        } else if a1 != a2 {
                            if rng.gen::<bool>() {
                                std::mem::swap(&mut a1, &mut a2);
                            }
                            if found_first_het {
                                unphased.push(m as u32);
                            } else {
                                found_first_het = true;
                            }
                        }
                        hap1[m] = a1;
                        hap2[m] = a2;
                    }

                    (
                        Arc::new(markers.alleles_to_bits(&hap1)),
                        Arc::new(markers.alleles_to_bits(&hap2)),
                        unphased.into(),
                        missing.into(),
                    )
                })
                .collect();

        let mut haps = Vec::with_capacity(2 * n_samples);
        let mut unphased = Vec::with_capacity(n_samples);
        let mut missing = Vec::with_capacity(n_samples);
        for (h1, h2, unph, miss) in per_sample {
            haps.push(h1);
            haps.push(h2);
            unphased.push(unph);
            missing.push(miss);
        }

        Self {
            markers,
            samples: Arc::clone(targ.samples()),
            haps,
            unphased,
            missing,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.unphased.len()
    }

    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn markers(&self) -> &Arc<Markers> {
        &self.markers
    }

    /// Remaining unphased-heterozygote markers (strictly increasing)
    pub fn unphased(&self, sample: u32) -> &Arc<[u32]> {
        &self.unphased[sample as usize]
    }

    /// Missing-genotype markers (strictly increasing)
    pub fn missing(&self, sample: u32) -> &Arc<[u32]> {
        &self.missing[sample as usize]
    }

    /// Total remaining unphased heterozygotes over all samples
    pub fn total_unphased(&self) -> usize {
        self.unphased.iter().map(|u| u.len()).sum()
    }

    /// Unpack the sample's haplotype pair
    pub fn get_haps(&self, sample: u32, hap1: &mut [u8], hap2: &mut [u8]) {
        let s = SampleIdx::new(sample);
        let bits1 = &self.haps[s.hap1().as_usize()];
        let bits2 = &self.haps[s.hap2().as_usize()];
        for m in 0..self.markers.len() {
            let idx = MarkerIdx::new(m as u32);
            hap1[m] = self.markers.bits_to_allele(bits1, idx);
            hap2[m] = self.markers.bits_to_allele(bits2, idx);
        }
    }

    /// Unpack the haplotype pair into signed allele arrays
    pub fn get_haps_i32(&self, sample: u32, hap1: &mut [i32], hap2: &mut [i32]) {
        let s = SampleIdx::new(sample);
        let bits1 = &self.haps[s.hap1().as_usize()];
        let bits2 = &self.haps[s.hap2().as_usize()];
        for m in 0..self.markers.len() {
            let idx = MarkerIdx::new(m as u32);
            hap1[m] = self.markers.bits_to_allele(bits1, idx) as i32;
            hap2[m] = self.markers.bits_to_allele(bits2, idx) as i32;
        }
    }

    /// Replace the sample's haplotype pair
    pub fn set_hap_pair(&mut self, sample: u32, hap1: &[u8], hap2: &[u8]) {
        let s = SampleIdx::new(sample);
        self.haps[s.hap1().as_usize()] = Arc::new(self.markers.alleles_to_bits(hap1));
        self.haps[s.hap2().as_usize()] = Arc::new(self.markers.alleles_to_bits(hap2));
    }

    /// Replace the sample's unphased list.
    ///
    /// # Panics
    /// Panics if the new list is not a subset of the current list
    /// (the unphased set may only shrink).
    pub fn set_unphased(&mut self, sample: u32, new_unphased: Vec<u32>) {
        let old = &self.unphased[sample as usize];
        let mut old_iter = old.iter();
        for &new_mkr in &new_unphased {
            assert!(
                old_iter.any(|&old_mkr| old_mkr == new_mkr),
                "unphased list is not a subset of its predecessor"
            );
        }
        self.unphased[sample as usize] = new_unphased.into();
    }

    /// Apply a worker task's update
    pub fn apply(&mut self, update: SampleUpdate) {
        self.set_hap_pair(update.sample, &update.hap1, &update.hap2);
        if let Some(unphased) = update.unphased {
            self.set_unphased(update.sample, unphased);
        }
    }

    /// Snapshot the current phased haplotype estimates
    pub fn haps_gt(&self) -> HapsGt {
        HapsGt::new(
            Arc::clone(&self.markers),
            Arc::clone(&self.samples),
            self.haps.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::gt::{BasicGt, GtRec};
    use crate::data::haplotype::Samples;
    use crate::data::marker::{Allele, ChromIdx, Marker};

    fn build_targ(genotypes: &[Vec<(u8, u8)>]) -> TargGt {
        let n_samples = genotypes.len();
        let n_markers = genotypes[0].len();
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n_markers {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 100,
                Vec::new(),
                vec![Allele::Base(0), Allele::Base(1)],
            ));
        }
        let ids: Vec<String> = (0..n_samples).map(|s| format!("S{}", s)).collect();
        let samples = Arc::new(Samples::from_ids(&ids));
        let recs = (0..n_markers)
            .map(|m| {
                let a1 = genotypes.iter().map(|g| g[m].0).collect();
                let a2 = genotypes.iter().map(|g| g[m].1).collect();
                GtRec::new(a1, a2, vec![false; n_samples])
            })
            .collect();
        TargGt::Basic(Arc::new(BasicGt::new(markers, samples, recs)))
    }

    #[test]
    fn test_initialisation() {
        let m = MISSING_ALLELE;
        let gt = build_targ(&[
            vec![(0, 1), (0, 0), (1, 0), (m, m), (0, 1)],
            vec![(0, 0), (0, 0), (0, 0), (0, 0), (0, 0)],
        ]);
        let est = EstPhase::new(&gt, None, 0, 42);

        // first het anchors phase: sample 0 has hets at 0, 2, 4 and one
        // missing genotype at 3
        assert_eq!(est.unphased(0).as_ref(), &[2, 4]);
        assert_eq!(est.missing(0).as_ref(), &[3]);
        assert!(est.unphased(1).is_empty());
        assert!(est.missing(1).is_empty());

        // unordered genotypes are preserved
        let mut h1 = vec![0u8; 5];
        let mut h2 = vec![0u8; 5];
        est.get_haps(0, &mut h1, &mut h2);
        for m in [0usize, 1, 2, 4] {
            let idx = MarkerIdx::new(m as u32);
            let mut obs = [h1[m], h2[m]];
            let mut exp = [gt.allele1(idx, SampleIdx(0)), gt.allele2(idx, SampleIdx(0))];
            obs.sort_unstable();
            exp.sort_unstable();
            assert_eq!(obs, exp, "genotype changed at marker {}", m);
        }
        // the missing genotype was imputed to a valid allele
        assert!(h1[3] < 2 && h2[3] < 2);
    }

    #[test]
    fn test_overlap_copied_verbatim() {
        let gt = build_targ(&[vec![(1, 0), (0, 1), (0, 1), (1, 1)]]);
        // mark the first two markers as phased overlap
        let est = EstPhase::new(&gt, None, 2, 1);
        let mut h1 = vec![0u8; 4];
        let mut h2 = vec![0u8; 4];
        est.get_haps(0, &mut h1, &mut h2);
        assert_eq!(&h1[..2], &[1, 0]);
        assert_eq!(&h2[..2], &[0, 1]);
        // the overlap contains a het, so every later het is unphased
        assert_eq!(est.unphased(0).as_ref(), &[2]);
    }

    #[test]
    fn test_set_unphased_subset() {
        let gt = build_targ(&[vec![(0, 1), (0, 1), (0, 1), (0, 1)]]);
        let mut est = EstPhase::new(&gt, None, 0, 9);
        let unphased: Vec<u32> = est.unphased(0).to_vec();
        assert_eq!(unphased, vec![1, 2, 3]);
        est.set_unphased(0, vec![1, 3]);
        assert_eq!(est.unphased(0).as_ref(), &[1, 3]);
    }

    #[test]
    #[should_panic(expected = "not a subset")]
    fn test_set_unphased_rejects_additions() {
        let gt = build_targ(&[vec![(0, 1), (0, 1), (0, 1)]]);
        let mut est = EstPhase::new(&gt, None, 0, 9);
        est.set_unphased(0, vec![0]); // marker 0 anchors phase, never unphased
    }

    #[test]
    fn test_deterministic_seeding() {
        let m = MISSING_ALLELE;
        let gt = build_targ(&[vec![(0, 1), (m, m), (1, 0), (0, 1)]]);
        let a = EstPhase::new(&gt, None, 0, 77);
        let b = EstPhase::new(&gt, None, 0, 77);
        let mut ha1 = vec![0u8; 4];
        let mut ha2 = vec![0u8; 4];
        let mut hb1 = vec![0u8; 4];
        let mut hb2 = vec![0u8; 4];
        a.get_haps(0, &mut ha1, &mut ha2);
        b.get_haps(0, &mut hb1, &mut hb2);
        assert_eq!(ha1, hb1);
        assert_eq!(ha2, hb2);
    }
}

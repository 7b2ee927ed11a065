//! # Haplotype Completion Store
//!
//! Collects the stage-2 output haplotypes over all markers and the
//! partially-imputed alleles whose posterior mass was dominated by states
//! with undetermined alleles. A second pass re-scores those alleles
//! against the final phased panel.

use rayon::prelude::*;
use std::sync::Arc;

use crate::data::gt::HapsGt;
use crate::data::haplotype::{HapIdx, Samples};
use crate::data::marker::{Markers, PackedAlleles};

/// An allele whose imputation is finished against the final phased panel
#[derive(Clone, Debug)]
pub struct PartlyImputedAllele {
    marker: u32,
    /// Posterior allele probabilities from the states with observable
    /// alleles
    al_probs: Vec<f32>,
    /// Target haplotypes of the states with undetermined alleles
    ref_haps: Vec<u32>,
    /// Their posterior state probabilities
    state_probs: Vec<f32>,
}

impl PartlyImputedAllele {
    pub fn new(marker: u32, al_probs: Vec<f32>, ref_haps: Vec<u32>, state_probs: Vec<f32>) -> Self {
        assert_eq!(
            ref_haps.len(),
            state_probs.len(),
            "state list length mismatch"
        );
        Self {
            marker,
            al_probs,
            ref_haps,
            state_probs,
        }
    }

    pub fn marker(&self) -> usize {
        self.marker as usize
    }

    /// Re-score against the final phased haplotypes and pick the argmax
    fn impute_allele(&self, phased: &HapsGt) -> u8 {
        let mut probs = self.al_probs.clone();
        for (j, &hap) in self.ref_haps.iter().enumerate() {
            let allele = phased.allele(
                crate::data::marker::MarkerIdx::new(self.marker),
                HapIdx::new(hap),
            );
            probs[allele as usize] += self.state_probs[j];
        }
        let mut imputed = 0;
        for j in 1..probs.len() {
            if probs[j] > probs[imputed] {
                imputed = j;
            }
        }
        imputed as u8
    }
}

/// Thread-shared store of stage-2 haplotypes; worker results are applied
/// after the parallel pass.
pub struct HapImputer {
    markers: Arc<Markers>,
    samples: Arc<Samples>,
    haps: Vec<Option<Arc<PackedAlleles>>>,
    partly_imputed: Vec<Vec<PartlyImputedAllele>>,
}

impl HapImputer {
    pub fn new(markers: Arc<Markers>, samples: Arc<Samples>) -> Self {
        let n_haps = samples.n_haps();
        Self {
            markers,
            samples,
            haps: vec![None; n_haps],
            partly_imputed: (0..n_haps).map(|_| Vec::new()).collect(),
        }
    }

    pub fn markers(&self) -> &Arc<Markers> {
        &self.markers
    }

    /// Store one haplotype's alleles over all markers
    pub fn set_hap(&mut self, hap: u32, alleles: &[u8]) {
        self.haps[hap as usize] = Some(Arc::new(self.markers.alleles_to_bits(alleles)));
    }

    /// Store a haplotype's partially-imputed alleles
    pub fn set_partly_imputed(&mut self, hap: u32, partly: Vec<PartlyImputedAllele>) {
        self.partly_imputed[hap as usize] = partly;
    }

    /// Resolve all partially-imputed alleles against the stored panel and
    /// return the completed phased haplotypes.
    ///
    /// # Panics
    /// Panics if `set_hap` was not called for every haplotype.
    pub fn imputed_haps(self) -> HapsGt {
        let haps: Vec<Arc<PackedAlleles>> = self
            .haps
            .into_iter()
            .enumerate()
            .map(|(h, hap)| hap.unwrap_or_else(|| panic!("haplotype {} was never stored", h)))
            .collect();
        let first_pass = HapsGt::new(
            Arc::clone(&self.markers),
            Arc::clone(&self.samples),
            haps.clone(),
        );

        let markers = &self.markers;
        let final_haps: Vec<Arc<PackedAlleles>> = haps
            .into_par_iter()
            .enumerate()
            .map(|(h, hap)| {
                let partly = &self.partly_imputed[h];
                if partly.is_empty() {
                    return hap;
                }
                let mut alleles = markers.bits_to_alleles(&hap);
                for pia in partly {
                    alleles[pia.marker()] = pia.impute_allele(&first_pass);
                }
                Arc::new(markers.alleles_to_bits(&alleles))
            })
            .collect();

        HapsGt::new(self.markers, self.samples, final_haps)
    }
}

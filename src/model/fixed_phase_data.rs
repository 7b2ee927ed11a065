//! # Fixed Per-Window Phase Data
//!
//! Immutable inputs to the phasing iterations of one marker window: the
//! target genotypes spliced with the previous window's phased overlap,
//! per-allele carrier lists for low-frequency alleles, the high-frequency
//! marker subset with its restricted views, IBS2 segments, and the linear
//! interpolation weights used by stage-2 completion.

use rayon::prelude::*;
use std::sync::Arc;

use crate::config::Config;
use crate::data::genetic_map::{GeneticMaps, MarkerMap};
use crate::data::gt::{RefGt, TargGt};
use crate::data::haplotype::SampleIdx;
use crate::data::marker::{MarkerIdx, MISSING_ALLELE};
use crate::io::window::Window;
use crate::model::ibs2::Ibs2;

/// High-frequency fallback bound: if more than this fraction of target
/// markers is high-frequency, every marker is treated as high-frequency.
const MAX_HIFREQ_PROP: f32 = 0.9;

/// Minimum stored IBS2 segment length in cM
const MIN_IBS2_CM: f64 = 2.0;

/// Carrier classification of one (marker, allele) pair
#[derive(Clone, Debug)]
pub enum Carriers {
    /// No sample carries the allele
    Zero,
    /// Sorted carrier sample indices (reference samples offset by the
    /// target sample count)
    Low(Arc<[u32]>),
    /// More carriers than the low-frequency threshold
    High,
}

impl Carriers {
    pub fn is_high(&self) -> bool {
        matches!(self, Carriers::High)
    }

    /// Carrier samples; empty unless low-frequency
    pub fn samples(&self) -> &[u32] {
        match self {
            Carriers::Low(list) => list,
            _ => &[],
        }
    }
}

/// Immutable per-window phasing input
pub struct FixedPhaseData {
    window_index: usize,
    err: f32,

    map: MarkerMap,
    targ_gt: TargGt,
    ref_gt: Option<RefGt>,
    overlap: usize,

    hi_freq_map: MarkerMap,
    hi_freq_targ_gt: TargGt,
    hi_freq_ref_gt: Option<RefGt>,
    hi_freq_overlap: usize,
    ibs2: Ibs2,

    n_haps: usize,
    carriers: Vec<Vec<Carriers>>,

    hi_freq_indices: Arc<[u32]>,
    prev_hi_freq_marker: Vec<u32>,
    prev_wt: Vec<f32>,
}

impl FixedPhaseData {
    /// Build the fixed data for one window.
    ///
    /// `phased_overlap` holds the phased target genotypes of the previous
    /// window's trailing overlap; its markers must equal the leading
    /// target markers of this window.
    pub fn new(
        config: &Config,
        gen_maps: &GeneticMaps,
        window: &Window,
        phased_overlap: Option<TargGt>,
    ) -> Self {
        let targ_in_window = window.targ_gt.clone();
        let n_targ_markers = targ_in_window.n_markers();
        let map = MarkerMap::create(gen_maps, targ_in_window.markers());

        // restrict the reference panel to the genotyped markers
        let ref_gt = window.ref_gt.as_ref().map(|r| {
            let indices: Vec<usize> = window
                .indices
                .targ_to_ref_all()
                .iter()
                .map(|&m| m as usize)
                .collect();
            r.restrict(&indices)
        });

        let overlap = phased_overlap.as_ref().map_or(0, |o| o.n_markers());
        let targ_gt = match phased_overlap {
            Some(o) => targ_in_window.splice(o),
            None => targ_in_window,
        };

        let n_haps = targ_gt.n_haps() + ref_gt.as_ref().map_or(0, |r| r.n_haps());
        let err = config.err(n_haps);

        let n_samples = targ_gt.n_samples() + ref_gt.as_ref().map_or(0, |r| r.n_samples());
        let max_carriers = (n_samples as f64 * config.rare as f64).floor() as usize;
        let mut carriers = compute_carriers(&targ_gt, ref_gt.as_ref(), max_carriers);

        let hi_freq: Vec<usize> = (0..n_targ_markers)
            .filter(|&m| carriers[m].iter().filter(|c| c.is_high()).count() > 1)
            .collect();

        let fallback =
            hi_freq.len() < 2 || hi_freq.len() as f32 > MAX_HIFREQ_PROP * n_targ_markers as f32;

        if fallback {
            for marker_carriers in &mut carriers {
                for c in marker_carriers.iter_mut() {
                    *c = Carriers::High;
                }
            }
            let hi_freq_indices: Arc<[u32]> = (0..n_targ_markers as u32).collect();
            let ibs2 = Ibs2::new(&targ_gt, ref_gt.as_ref(), &map, MIN_IBS2_CM);
            Self {
                window_index: window.index,
                err,
                hi_freq_map: map.clone(),
                hi_freq_targ_gt: targ_gt.clone(),
                hi_freq_ref_gt: ref_gt.clone(),
                hi_freq_overlap: overlap,
                map,
                targ_gt,
                ref_gt,
                overlap,
                ibs2,
                n_haps,
                carriers,
                hi_freq_indices,
                prev_hi_freq_marker: (0..n_targ_markers as u32).collect(),
                prev_wt: vec![1.0; n_targ_markers],
            }
        } else {
            let hi_freq_map = map.restrict(&hi_freq);
            let hi_freq_targ_gt = targ_gt.restrict(&hi_freq);
            let hi_freq_ref_gt = ref_gt.as_ref().map(|r| r.restrict(&hi_freq));
            let hi_freq_overlap = hi_freq.partition_point(|&m| m < overlap);
            let hi_freq_indices: Arc<[u32]> = hi_freq.iter().map(|&m| m as u32).collect();
            let prev_hi_freq_marker = prev_hi_freq_marker(n_targ_markers, &hi_freq);
            let prev_wt = prev_wt(&map, &hi_freq);
            let ibs2 = Ibs2::new(
                &hi_freq_targ_gt,
                hi_freq_ref_gt.as_ref(),
                &hi_freq_map,
                MIN_IBS2_CM,
            );
            Self {
                window_index: window.index,
                err,
                map,
                targ_gt,
                ref_gt,
                overlap,
                hi_freq_map,
                hi_freq_targ_gt,
                hi_freq_ref_gt,
                hi_freq_overlap,
                ibs2,
                n_haps,
                carriers,
                hi_freq_indices,
                prev_hi_freq_marker,
                prev_wt,
            }
        }
    }

    pub fn window_index(&self) -> usize {
        self.window_index
    }

    /// Allele mismatch emission probability
    pub fn err(&self) -> f32 {
        self.err
    }

    /// Genetic map of all target markers
    pub fn map(&self) -> &MarkerMap {
        &self.map
    }

    /// Target genotypes at all target markers (overlap-spliced)
    pub fn targ_gt(&self) -> &TargGt {
        &self.targ_gt
    }

    /// Reference genotypes at all target markers
    pub fn ref_gt(&self) -> Option<&RefGt> {
        self.ref_gt.as_ref()
    }

    /// Number of leading markers phased by the previous window
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Genetic map of the high-frequency markers
    pub fn hi_freq_map(&self) -> &MarkerMap {
        &self.hi_freq_map
    }

    /// Target genotypes at the high-frequency markers
    pub fn hi_freq_targ_gt(&self) -> &TargGt {
        &self.hi_freq_targ_gt
    }

    /// Reference genotypes at the high-frequency markers
    pub fn hi_freq_ref_gt(&self) -> Option<&RefGt> {
        self.hi_freq_ref_gt.as_ref()
    }

    /// Number of leading high-frequency markers phased by the previous window
    pub fn hi_freq_overlap(&self) -> usize {
        self.hi_freq_overlap
    }

    /// IBS2 segments over the high-frequency markers
    pub fn ibs2(&self) -> &Ibs2 {
        &self.ibs2
    }

    /// Total number of target and reference haplotypes
    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    /// High-frequency marker indices (in target marker space)
    pub fn hi_freq_indices(&self) -> &Arc<[u32]> {
        &self.hi_freq_indices
    }

    /// Number of high-frequency markers
    pub fn n_hi_freq_markers(&self) -> usize {
        self.hi_freq_indices.len()
    }

    /// True if stage-2 completion is required (strict subset)
    pub fn has_low_freq_markers(&self) -> bool {
        self.hi_freq_indices.len() < self.targ_gt.n_markers()
    }

    /// Carrier classification of (marker, allele)
    pub fn carriers(&self, marker: usize, allele: u8) -> &Carriers {
        &self.carriers[marker][allele as usize]
    }

    /// True if the allele is low-frequency at the marker
    pub fn is_low_freq(&self, marker: usize, allele: u8) -> bool {
        !self.carriers[marker][allele as usize].is_high()
    }

    /// Index (in high-frequency space) of the last high-frequency marker
    /// at a position `<=` the given target marker, or 0 if none
    pub fn prev_hi_freq_marker(&self, marker: usize) -> usize {
        self.prev_hi_freq_marker[marker] as usize
    }

    /// Interpolation weight toward `prev_hi_freq_marker(marker)`
    pub fn prev_wt(&self, marker: usize) -> f32 {
        self.prev_wt[marker]
    }
}

/// Per-(marker, allele) carrier classification over target and reference
/// samples.
fn compute_carriers(
    targ: &TargGt,
    ref_gt: Option<&RefGt>,
    max_carriers: usize,
) -> Vec<Vec<Carriers>> {
    let n_targ_samples = targ.n_samples();
    (0..targ.n_markers())
        .into_par_iter()
        .map(|m| {
            let idx = MarkerIdx::new(m as u32);
            let n_alleles = targ.markers().marker(idx).n_alleles();
            let mut lists: Vec<Vec<u32>> = vec![Vec::new(); n_alleles];
            let mut over = vec![false; n_alleles];

            for s in 0..n_targ_samples {
                let sample = SampleIdx::new(s as u32);
                let pair = (targ.allele1(idx, sample), targ.allele2(idx, sample));
                record_carrier(pair, s as u32, max_carriers, &mut lists, &mut over);
            }
            if let Some(r) = ref_gt {
                for s in 0..r.n_samples() {
                    let sample = SampleIdx::new(s as u32);
                    let pair = (r.allele1(idx, sample), r.allele2(idx, sample));
                    let shifted = (n_targ_samples + s) as u32;
                    record_carrier(pair, shifted, max_carriers, &mut lists, &mut over);
                }
            }

            lists
                .into_iter()
                .zip(over)
                .map(|(list, is_over)| {
                    if is_over {
                        Carriers::High
                    } else if list.is_empty() {
                        Carriers::Zero
                    } else {
                        Carriers::Low(list.into())
                    }
                })
                .collect()
        })
        .collect()
}

/// Add a sample's genotype to the per-allele carrier lists; an allele
/// whose carrier count exceeds `max_carriers` is marked high-frequency and
/// its list dropped.
fn record_carrier(
    pair: (u8, u8),
    s: u32,
    max_carriers: usize,
    lists: &mut [Vec<u32>],
    over: &mut [bool],
) {
    let (a1, a2) = pair;
    for al in [a1, a2] {
        if al == MISSING_ALLELE {
            continue;
        }
        let al = al as usize;
        if over[al] || lists[al].last() == Some(&s) {
            continue;
        }
        lists[al].push(s);
        if lists[al].len() > max_carriers {
            over[al] = true;
            lists[al].clear();
        }
    }
}

/// For every target marker, the high-frequency index of the last
/// high-frequency marker at or before it (0 before the second one).
fn prev_hi_freq_marker(n_markers: usize, hi_freq: &[usize]) -> Vec<u32> {
    let mut out = vec![0u32; n_markers];
    let n_hi_freq = hi_freq.len();
    let mut start = hi_freq[1];
    for (j, &end) in hi_freq.iter().enumerate().skip(2) {
        out[start..end].fill(j as u32 - 1);
        start = end;
    }
    out[start..n_markers].fill(n_hi_freq as u32 - 1);
    out
}

/// Linear interpolation weight toward the previous high-frequency marker:
/// 1.0 at a high-frequency marker, decaying linearly in cM to 0.0 at the
/// next one.
fn prev_wt(map: &MarkerMap, hi_freq: &[usize]) -> Vec<f32> {
    let n_markers = map.n_markers();
    let mut wt = vec![1.0f32; n_markers];
    let mut start = hi_freq[0];
    for &end in &hi_freq[1..] {
        let pos_a = map.gen_pos(MarkerIdx(start as u32));
        let pos_b = map.gen_pos(MarkerIdx(end as u32));
        let d = pos_b - pos_a;
        wt[start] = 1.0;
        for m in start + 1..end {
            wt[m] = ((pos_b - map.gen_pos(MarkerIdx(m as u32))) / d) as f32;
        }
        start = end;
    }
    wt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::gt::{BasicGt, GtRec};
    use crate::data::haplotype::Samples;
    use crate::data::marker::{Allele, ChromIdx, Marker, Markers};
    use crate::io::window::{MarkerIndices, Window};

    /// Build a window over biallelic markers from per-sample genotype rows
    fn build_window(genotypes: &[Vec<(u8, u8)>]) -> Window {
        let n_samples = genotypes.len();
        let n_markers = genotypes[0].len();
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
                let a1 = genotypes.iter().map(|g| g[m].0).collect();
                let a2 = genotypes.iter().map(|g| g[m].1).collect();
                GtRec::new(a1, a2, vec![false; n_samples])
            })
            .collect();
        let targ_gt = TargGt::Basic(Arc::new(BasicGt::new(markers.clone(), samples, recs)));
        Window {
            index: 1,
            markers,
            targ_gt,
            ref_gt: None,
            indices: MarkerIndices::new(&vec![true; n_markers], 0, n_markers),
            last_on_chrom: true,
        }
    }

    fn config_with_rare(rare: f32) -> Config {
        let mut config = crate::config::tests::test_config();
        config.rare = rare;
        config
    }

    #[test]
    fn test_carrier_classification() {
        // 8 samples; marker 1 has one ALT carrier (sample 3)
        let genotypes: Vec<Vec<(u8, u8)>> = (0..8)
            .map(|s| {
                vec![
                    (0, 1),
                    if s == 3 { (0, 1) } else { (0, 0) },
                    ((s % 2) as u8, 1),
                ]
            })
            .collect();
        let window = build_window(&genotypes);
        // rare threshold keeps alleles with <= 2 carriers sparse
        let config = config_with_rare(0.3);
        let fpd = FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None);

        assert!(fpd.is_low_freq(1, 1));
        assert_eq!(fpd.carriers(1, 1).samples(), &[3]);
        assert!(!fpd.is_low_freq(0, 0));
        assert!(!fpd.is_low_freq(0, 1));
    }

    #[test]
    fn test_hi_freq_subset_and_weights() {
        // markers 0 and 2 are common/common, marker 1 is rare-alt
        let genotypes: Vec<Vec<(u8, u8)>> = (0..10)
            .map(|s| {
                vec![
                    ((s % 2) as u8, 1),
                    if s == 0 { (0, 1) } else { (0, 0) },
                    (0, (s % 2) as u8),
                    ((s % 2) as u8, (s % 2) as u8),
                ]
            })
            .collect();
        let window = build_window(&genotypes);
        let config = config_with_rare(0.11);
        let fpd = FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None);

        assert_eq!(fpd.hi_freq_indices().as_ref(), &[0, 2, 3]);
        assert!(fpd.has_low_freq_markers());
        assert_eq!(fpd.hi_freq_targ_gt().n_markers(), 3);

        // marker 1 lies midway between hi-freq markers 0 and 2
        assert_eq!(fpd.prev_hi_freq_marker(1), 0);
        assert!((fpd.prev_wt(1) - 0.5).abs() < 1e-6);
        assert_eq!(fpd.prev_wt(0), 1.0);
        assert_eq!(fpd.prev_wt(3), 1.0);
    }

    #[test]
    fn test_fallback_too_few_hi_freq() {
        // every marker has a singleton ALT: fewer than 2 hi-freq markers
        let genotypes: Vec<Vec<(u8, u8)>> = (0..6)
            .map(|s| (0..4).map(|m| if s == m { (0, 1) } else { (0, 0) }).collect())
            .collect();
        let window = build_window(&genotypes);
        let config = config_with_rare(0.2);
        let fpd = FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None);

        // fallback: all markers high-frequency, low-frequency carriers off
        assert_eq!(fpd.n_hi_freq_markers(), 4);
        assert!(!fpd.has_low_freq_markers());
        for m in 0..4 {
            for al in 0..2 {
                assert!(!fpd.is_low_freq(m, al));
            }
        }
    }

    #[test]
    fn test_fallback_too_many_hi_freq() {
        // all markers common: |H| == nMarkers > 0.9 * nMarkers
        let genotypes: Vec<Vec<(u8, u8)>> = (0..10)
            .map(|s| (0..5).map(|_| ((s % 2) as u8, 1)).collect())
            .collect();
        let window = build_window(&genotypes);
        let config = config_with_rare(0.11);
        let fpd = FixedPhaseData::new(&config, &GeneticMaps::new(), &window, None);

        assert_eq!(fpd.n_hi_freq_markers(), 5);
        assert!(!fpd.has_low_freq_markers());
        assert_eq!(fpd.prev_wt(3), 1.0);
    }
}

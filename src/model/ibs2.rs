//! # IBS2 Segment Discovery
//!
//! Finds, for every target sample, the segments over which it shares both
//! unordered alleles (IBS2) with another target or reference sample for at
//! least a minimum genetic length. The PBWT neighbour finder excludes such
//! pairs so the HMM state space is not dominated by close relatives.
//!
//! Reference sample indices are offset by the number of target samples.

use rayon::prelude::*;

use crate::data::genetic_map::MarkerMap;
use crate::data::gt::{RefGt, TargGt};
use crate::data::haplotype::SampleIdx;
use crate::data::marker::{MarkerIdx, MISSING_ALLELE};

/// Minimum number of markers per IBS2 detection window
const MIN_STEP_MARKERS: usize = 100;

/// Maximum number of markers per IBS2 detection window
const MAX_STEP_MARKERS: usize = 1500;

/// Maximum genetic gap merged between segments of the same pair
const MAX_IBD_GAP_CM: f64 = 4.0;

/// A shared haplotype-pair segment with another sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSeg {
    /// The other sample (reference samples offset by the target count)
    pub sample: u32,
    /// First marker of the segment (inclusive)
    pub start: u32,
    /// Last marker of the segment (inclusive)
    pub incl_end: u32,
}

impl SampleSeg {
    pub fn new(sample: u32, start: u32, incl_end: u32) -> Self {
        assert!(start <= incl_end, "segment start after its end");
        Self {
            sample,
            start,
            incl_end,
        }
    }

    pub fn contains(&self, marker: usize) -> bool {
        self.start as usize <= marker && marker <= self.incl_end as usize
    }
}

/// IBS2 segments of every target sample
pub struct Ibs2 {
    sample_segs: Vec<Vec<SampleSeg>>,
    min_cm: f64,
}

struct SampClust {
    samples: Vec<u32>,
    are_homozygous: bool,
}

impl Ibs2 {
    /// Detect IBS2 segments of at least `min_cm` centiMorgans
    pub fn new(targ: &TargGt, ref_gt: Option<&RefGt>, map: &MarkerMap, min_cm: f64) -> Self {
        assert_eq!(targ.n_markers(), map.n_markers(), "marker map mismatch");
        assert!(min_cm > 0.0 && min_cm.is_finite(), "invalid minimum length");

        let n_markers = targ.n_markers();
        let n_targ_samples = targ.n_samples();
        let window_starts = window_starts(map, 0.5 * min_cm);

        // per window: the IBS2 sample cluster of each target sample
        let id_sets: Vec<Vec<Vec<u32>>> = (0..window_starts.len())
            .into_par_iter()
            .map(|w| {
                let start = window_starts[w];
                let end = window_starts.get(w + 1).copied().unwrap_or(n_markers);
                ibs_samples(targ, ref_gt, start, end)
            })
            .collect();

        let sample_segs: Vec<Vec<SampleSeg>> = (0..n_targ_samples)
            .into_par_iter()
            .map(|s| {
                let list = seg_list(s, n_markers - 1, &window_starts, &id_sets);
                let merged = merge(list, map);
                let extended = extend(targ, ref_gt, s as u32, merged);
                let merged = merge(extended, map);
                merged
                    .into_iter()
                    .filter(|seg| {
                        let len = map.gen_pos(MarkerIdx(seg.incl_end))
                            - map.gen_pos(MarkerIdx(seg.start));
                        len >= min_cm
                    })
                    .collect()
            })
            .collect();

        Self {
            sample_segs,
            min_cm,
        }
    }

    /// An empty instance with no segments (used when IBS2 filtering is off)
    pub fn empty(n_targ_samples: usize) -> Self {
        Self {
            sample_segs: vec![Vec::new(); n_targ_samples],
            min_cm: 0.0,
        }
    }

    /// Minimum stored segment length in cM
    pub fn min_cm(&self) -> f64 {
        self.min_cm
    }

    /// Number of target samples
    pub fn n_targ_samples(&self) -> usize {
        self.sample_segs.len()
    }

    /// The stored segments of a target sample
    pub fn segments(&self, sample: u32) -> &[SampleSeg] {
        &self.sample_segs[sample as usize]
    }

    /// True if the two samples lie in a stored IBS2 segment at the marker.
    /// A sample is always IBS2 with itself.
    pub fn are_ibs2(&self, targ_sample: u32, other_sample: u32, marker: usize) -> bool {
        if targ_sample == other_sample {
            return true;
        }
        self.sample_segs[targ_sample as usize]
            .iter()
            .any(|seg| seg.sample == other_sample && seg.contains(marker))
    }
}

/// Window starts of at least `min_cm` genetic length, clamped to
/// `[MIN_STEP_MARKERS, MAX_STEP_MARKERS]` markers; an undersized trailing
/// window is merged into its predecessor.
fn window_starts(map: &MarkerMap, min_cm: f64) -> Vec<usize> {
    let gen_pos = map.gen_positions();
    let n = gen_pos.len();
    let mut starts = Vec::new();
    let mut next = 0usize;
    while next < n {
        starts.push(next);
        let target = gen_pos[next] + min_cm;
        let by_cm = next + gen_pos[next..].partition_point(|&p| p < target);
        next = by_cm.clamp(next + MIN_STEP_MARKERS, next + MAX_STEP_MARKERS);
    }
    if starts.len() > 1 {
        let last = *starts.last().unwrap();
        if (n - last) < MIN_STEP_MARKERS / 2 || (gen_pos[n - 1] - gen_pos[last]) < min_cm {
            starts.pop();
        }
    }
    starts
}

fn alleles_at(
    targ: &TargGt,
    ref_gt: Option<&RefGt>,
    m: usize,
    s: u32,
) -> (u8, u8) {
    let n_targ = targ.n_samples() as u32;
    let idx = MarkerIdx::new(m as u32);
    if s < n_targ {
        let sample = SampleIdx(s);
        (targ.allele1(idx, sample), targ.allele2(idx, sample))
    } else {
        let r = ref_gt.expect("sample index beyond target range without reference");
        let sample = SampleIdx(s - n_targ);
        (r.allele1(idx, sample), r.allele2(idx, sample))
    }
}

/// Recursively partition all samples by their unordered genotypes over one
/// window; returns the surviving cluster of each target sample.
fn ibs_samples(
    targ: &TargGt,
    ref_gt: Option<&RefGt>,
    start: usize,
    end: usize,
) -> Vec<Vec<u32>> {
    let n_targ_samples = targ.n_samples();
    let n_samples = n_targ_samples + ref_gt.map_or(0, |r| r.n_samples());

    let mut clusters = vec![SampClust {
        samples: (0..n_samples as u32).collect(),
        are_homozygous: true,
    }];
    for m in start..end {
        let mut next = Vec::new();
        for parent in clusters {
            partition(targ, ref_gt, parent, m, n_targ_samples, &mut next);
        }
        clusters = next;
        if clusters.is_empty() {
            break;
        }
    }
    cluster_results(clusters, n_targ_samples)
}

/// Split one cluster by the unordered genotype at a marker.
///
/// Samples with a missing allele propagate into every child cluster; a
/// child of reference samples only is created when it can be seeded by a
/// missing target sample. Sample lists stay sorted in increasing order.
fn partition(
    targ: &TargGt,
    ref_gt: Option<&RefGt>,
    parent: SampClust,
    m: usize,
    n_targ_samples: usize,
    out: &mut Vec<SampClust>,
) {
    let n_alleles = targ.markers().marker(MarkerIdx::new(m as u32)).n_alleles();
    let mut gt_to_list: Vec<Option<Vec<u32>>> = vec![None; n_alleles * n_alleles];
    let mut are_hom = vec![false; n_alleles * n_alleles];
    let mut gt_indices: Vec<usize> = Vec::new();
    let mut missing_targ_samples: Vec<u32> = Vec::new();

    for &s in &parent.samples {
        let (a1, a2) = alleles_at(targ, ref_gt, m, s);
        if a1 == MISSING_ALLELE || a2 == MISSING_ALLELE {
            debug_assert!((s as usize) < n_targ_samples);
            missing_targ_samples.push(s);
            for &gt in &gt_indices {
                gt_to_list[gt].as_mut().unwrap().push(s);
            }
        } else {
            let (lo, hi) = if a1 <= a2 { (a1, a2) } else { (a2, a1) };
            let gt_index = lo as usize * n_alleles + hi as usize;
            if let Some(list) = gt_to_list[gt_index].as_mut() {
                list.push(s);
            } else if (s as usize) < n_targ_samples || !missing_targ_samples.is_empty() {
                gt_indices.push(gt_index);
                are_hom[gt_index] = parent.are_homozygous && a1 == a2;
                let mut list = missing_targ_samples.clone();
                list.push(s);
                gt_to_list[gt_index] = Some(list);
            }
        }
    }

    for gt in gt_indices {
        let list = gt_to_list[gt].take().unwrap();
        if list.len() > 1 {
            out.push(SampClust {
                samples: list,
                are_homozygous: are_hom[gt],
            });
        }
    }
}

/// Collect surviving non-homozygous clusters per target sample.
///
/// A sample can appear in more than one cluster through missing genotypes;
/// its lists are merged and deduplicated.
fn cluster_results(clusters: Vec<SampClust>, n_targ_samples: usize) -> Vec<Vec<u32>> {
    let mut results: Vec<Vec<u32>> = vec![Vec::new(); n_targ_samples];
    for clust in clusters {
        if clust.are_homozygous || clust.samples.len() < 2 {
            continue;
        }
        for &s in &clust.samples {
            if (s as usize) >= n_targ_samples {
                break; // sample lists are increasing
            }
            let entry = &mut results[s as usize];
            if entry.is_empty() {
                *entry = clust.samples.clone();
            } else {
                entry.extend_from_slice(&clust.samples);
                entry.sort_unstable();
                entry.dedup();
            }
        }
    }
    results
}

fn seg_list(
    s: usize,
    n_markers_m1: usize,
    window_starts: &[usize],
    id_sets: &[Vec<Vec<u32>>],
) -> Vec<SampleSeg> {
    let mut list = Vec::new();
    for (w, sets) in id_sets.iter().enumerate() {
        let cluster = &sets[s];
        if cluster.is_empty() {
            continue;
        }
        let start = window_starts[w];
        let incl_end = window_starts
            .get(w + 1)
            .map(|&next| next - 1)
            .unwrap_or(n_markers_m1);
        for &s2 in cluster {
            if s2 as usize != s {
                list.push(SampleSeg::new(s2, start as u32, incl_end as u32));
            }
        }
    }
    list
}

/// Merge segments of the same pair whose genetic gap is small
fn merge(mut list: Vec<SampleSeg>, map: &MarkerMap) -> Vec<SampleSeg> {
    if list.len() < 2 {
        return list;
    }
    list.sort_unstable_by_key(|seg| (seg.sample, seg.start));
    let mut merged = Vec::with_capacity(list.len());
    let mut prev = list[0];
    for next in list.into_iter().skip(1) {
        let gap = map.gen_pos(MarkerIdx(next.start)) - map.gen_pos(MarkerIdx(prev.incl_end));
        if prev.sample == next.sample && gap <= MAX_IBD_GAP_CM {
            prev = SampleSeg::new(prev.sample, prev.start, next.incl_end.max(prev.incl_end));
        } else {
            merged.push(prev);
            prev = next;
        }
    }
    merged.push(prev);
    merged
}

/// Extend each segment marker by marker while the pair stays IBS2,
/// without crossing a neighbouring segment of the same pair.
fn extend(
    targ: &TargGt,
    ref_gt: Option<&RefGt>,
    sample: u32,
    list: Vec<SampleSeg>,
) -> Vec<SampleSeg> {
    let n_markers = targ.n_markers();
    (0..list.len())
        .map(|i| {
            let seg = list[i];
            let sample2 = seg.sample;
            let min_start = match i.checked_sub(1).map(|j| list[j]) {
                Some(prev) if prev.sample == sample2 => prev.incl_end as usize,
                _ => 0,
            };
            let max_excl_end = match list.get(i + 1) {
                Some(next) if next.sample == sample2 => next.start as usize,
                _ => n_markers,
            };

            let mut start = seg.start as usize;
            let mut excl_end = seg.incl_end as usize + 1;
            while start > min_start && is_ibs2_at(targ, ref_gt, start - 1, sample, sample2) {
                start -= 1;
            }
            while excl_end < max_excl_end && is_ibs2_at(targ, ref_gt, excl_end, sample, sample2) {
                excl_end += 1;
            }
            SampleSeg::new(sample2, start as u32, (excl_end - 1) as u32)
        })
        .collect()
}

fn is_ibs2_at(targ: &TargGt, ref_gt: Option<&RefGt>, m: usize, s1: u32, s2: u32) -> bool {
    let (a1, a2) = alleles_at(targ, ref_gt, m, s1);
    let (b1, b2) = alleles_at(targ, ref_gt, m, s2);
    are_phase_consistent(a1, a2, b1, b2) || are_phase_consistent(a1, a2, b2, b1)
}

fn are_phase_consistent(a1: u8, a2: u8, b1: u8, b2: u8) -> bool {
    (a1 == MISSING_ALLELE || b1 == MISSING_ALLELE || a1 == b1)
        && (a2 == MISSING_ALLELE || b2 == MISSING_ALLELE || a2 == b2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::gt::{BasicGt, GtRec};
    use crate::data::haplotype::Samples;
    use crate::data::marker::{Allele, ChromIdx, Marker, Markers};
    use std::sync::Arc;

    /// Build an unphased GT from per-sample genotype rows [(a1, a2); markers]
    fn build_gt(genotypes: &[Vec<(u8, u8)>]) -> TargGt {
        let n_samples = genotypes.len();
        let n_markers = genotypes[0].len();
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n_markers {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 1000,
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
    fn test_sample_seg_contains() {
        let seg = SampleSeg::new(1, 10, 20);
        assert!(seg.contains(10));
        assert!(seg.contains(20));
        assert!(!seg.contains(9));
        assert!(!seg.contains(21));
    }

    #[test]
    fn test_phase_consistency() {
        assert!(are_phase_consistent(0, 1, 0, 1));
        assert!(!are_phase_consistent(0, 1, 1, 0));
        assert!(!are_phase_consistent(0, 0, 1, 1));
        assert!(are_phase_consistent(MISSING_ALLELE, 1, 0, 1));
        assert!(are_phase_consistent(0, MISSING_ALLELE, 0, 1));
    }

    #[test]
    fn test_identical_samples_are_ibs2_everywhere() {
        // 300 markers, 1 cM apart: several detection windows
        let n_markers = 300;
        let pattern: Vec<(u8, u8)> = (0..n_markers)
            .map(|m| match m % 4 {
                0 => (0, 1),
                1 => (1, 1),
                2 => (0, 0),
                _ => (0, 1),
            })
            .collect();
        let other: Vec<(u8, u8)> = (0..n_markers)
            .map(|m| if m % 2 == 0 { (0, 0) } else { (1, 1) })
            .collect();
        let gt = build_gt(&[pattern.clone(), pattern, other]);
        let map = MarkerMap::from_gen_pos((0..n_markers).map(|m| m as f64).collect());

        let ibs2 = Ibs2::new(&gt, None, &map, 2.0);
        // the identical pair is IBS2 over the whole chromosome
        for m in [0, 50, 150, 299] {
            assert!(ibs2.are_ibs2(0, 1, m), "pair (0,1) at marker {}", m);
            assert!(ibs2.are_ibs2(1, 0, m), "pair (1,0) at marker {}", m);
        }
        // the unrelated sample is not
        assert!(!ibs2.are_ibs2(0, 2, 150));
    }

    #[test]
    fn test_segment_containment() {
        // every marker implied by a stored segment reports IBS2
        let n_markers = 250;
        let pattern: Vec<(u8, u8)> = (0..n_markers).map(|m| ((m % 2) as u8, 1)).collect();
        let gt = build_gt(&[pattern.clone(), pattern]);
        let map = MarkerMap::from_gen_pos((0..n_markers).map(|m| m as f64 * 0.05).collect());
        let ibs2 = Ibs2::new(&gt, None, &map, 2.0);

        for seg in ibs2.segments(0) {
            for m in seg.start..=seg.incl_end {
                assert!(ibs2.are_ibs2(0, seg.sample, m as usize));
            }
        }
    }

    #[test]
    fn test_pure_homozygous_group_discarded() {
        // all samples homozygous everywhere: trivial matches are not IBS2
        let n_markers = 220;
        let hom: Vec<(u8, u8)> = (0..n_markers).map(|_| (0, 0)).collect();
        let gt = build_gt(&[hom.clone(), hom.clone(), hom]);
        let map = MarkerMap::from_gen_pos((0..n_markers).map(|m| m as f64).collect());
        let ibs2 = Ibs2::new(&gt, None, &map, 2.0);
        assert!(ibs2.segments(0).is_empty());
        assert!(!ibs2.are_ibs2(0, 1, 100));
    }

    #[test]
    fn test_self_is_always_ibs2() {
        let ibs2 = Ibs2::empty(3);
        assert!(ibs2.are_ibs2(2, 2, 0));
        assert!(!ibs2.are_ibs2(2, 1, 0));
    }

    #[test]
    fn test_window_starts_clamping() {
        // dense markers: the cM target is reached immediately but windows
        // must still span at least MIN_STEP_MARKERS markers
        let map = MarkerMap::from_gen_pos((0..1000).map(|m| m as f64 * 10.0).collect());
        let starts = window_starts(&map, 1.0);
        for w in starts.windows(2) {
            assert!(w[1] - w[0] >= MIN_STEP_MARKERS);
        }

        // sparse markers: windows are capped at MAX_STEP_MARKERS markers
        let map = MarkerMap::from_gen_pos((0..5000).map(|m| m as f64 * 1e-6).collect());
        let starts = window_starts(&map, 1.0);
        for w in starts.windows(2) {
            assert!(w[1] - w[0] <= MAX_STEP_MARKERS);
        }
    }
}

//! # Genotype Façades
//!
//! Uniform read-only views over per-marker allele access. `TargGt` is a
//! tagged variant over the four target-genotype representations (basic
//! records, packed haplotypes, restricted view, spliced view); `RefGt`
//! holds phased, non-missing reference records.

use std::sync::Arc;

use crate::data::haplotype::{HapIdx, SampleIdx, Samples};
use crate::data::marker::{MarkerIdx, Markers, PackedAlleles, MISSING_ALLELE};
use crate::data::storage::RefColumn;

/// Genotypes of all target samples at one marker.
///
/// Allele values are `0..n_alleles`, with `MISSING_ALLELE` (255) for
/// missing data; the phased flag is tracked per sample.
#[derive(Clone, Debug)]
pub struct GtRec {
    a1: Vec<u8>,
    a2: Vec<u8>,
    phased: Vec<bool>,
}

impl GtRec {
    /// Create a record.
    ///
    /// # Panics
    /// Panics if the slice lengths differ.
    pub fn new(a1: Vec<u8>, a2: Vec<u8>, phased: Vec<bool>) -> Self {
        assert_eq!(a1.len(), a2.len(), "allele slice length mismatch");
        assert_eq!(a1.len(), phased.len(), "phased slice length mismatch");
        Self { a1, a2, phased }
    }

    pub fn n_samples(&self) -> usize {
        self.a1.len()
    }

    #[inline]
    pub fn allele1(&self, s: SampleIdx) -> u8 {
        self.a1[s.as_usize()]
    }

    #[inline]
    pub fn allele2(&self, s: SampleIdx) -> u8 {
        self.a2[s.as_usize()]
    }

    #[inline]
    pub fn allele(&self, h: HapIdx) -> u8 {
        let s = h.as_usize() >> 1;
        if h.0 & 1 == 0 {
            self.a1[s]
        } else {
            self.a2[s]
        }
    }

    #[inline]
    pub fn is_phased(&self, s: SampleIdx) -> bool {
        self.phased[s.as_usize()]
    }

    /// True if every sample is phased and non-missing
    pub fn all_phased(&self) -> bool {
        self.phased.iter().all(|&p| p)
            && self
                .a1
                .iter()
                .chain(self.a2.iter())
                .all(|&a| a != MISSING_ALLELE)
    }
}

/// Target genotypes stored as per-marker records
#[derive(Clone, Debug)]
pub struct BasicGt {
    markers: Markers,
    samples: Arc<Samples>,
    recs: Vec<GtRec>,
    all_phased: bool,
}

impl BasicGt {
    pub fn new(markers: Markers, samples: Arc<Samples>, recs: Vec<GtRec>) -> Self {
        assert_eq!(markers.len(), recs.len(), "marker/record count mismatch");
        let all_phased = recs.iter().all(|r| r.all_phased());
        Self {
            markers,
            samples,
            recs,
            all_phased,
        }
    }

    pub fn rec(&self, m: MarkerIdx) -> &GtRec {
        &self.recs[m.as_usize()]
    }
}

/// Phased target haplotypes stored as packed allele bits
#[derive(Clone, Debug)]
pub struct HapsGt {
    markers: Arc<Markers>,
    samples: Arc<Samples>,
    haps: Vec<Arc<PackedAlleles>>,
}

impl HapsGt {
    pub fn new(markers: Arc<Markers>, samples: Arc<Samples>, haps: Vec<Arc<PackedAlleles>>) -> Self {
        assert_eq!(haps.len(), samples.n_haps(), "haplotype count mismatch");
        Self {
            markers,
            samples,
            haps,
        }
    }

    #[inline]
    pub fn allele(&self, m: MarkerIdx, h: HapIdx) -> u8 {
        self.markers.bits_to_allele(&self.haps[h.as_usize()], m)
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn samples(&self) -> &Arc<Samples> {
        &self.samples
    }

    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn n_haps(&self) -> usize {
        self.haps.len()
    }

    /// Unpack one haplotype's allele vector
    pub fn hap_alleles(&self, h: HapIdx) -> Vec<u8> {
        self.markers.bits_to_alleles(&self.haps[h.as_usize()])
    }
}

/// View of a subset of an inner GT's markers
#[derive(Clone, Debug)]
pub struct RestrictedGt {
    inner: TargGt,
    indices: Arc<[usize]>,
    markers: Markers,
}

/// A GT whose leading markers come from a phased overlap and whose
/// remaining markers come from the current window's target genotypes.
#[derive(Clone, Debug)]
pub struct SplicedGt {
    overlap: TargGt,
    targ: TargGt,
}

/// Uniform read-only façade over target genotype representations
#[derive(Clone, Debug)]
pub enum TargGt {
    Basic(Arc<BasicGt>),
    Haps(HapsGt),
    Restricted(Box<RestrictedGt>),
    Spliced(Box<SplicedGt>),
}

impl TargGt {
    /// Splice a phased overlap onto the front of this GT.
    ///
    /// # Panics
    /// Panics if the overlap has more markers than `self`, is unphased, or
    /// its markers disagree with the leading markers of `self`.
    pub fn splice(self, overlap: TargGt) -> TargGt {
        assert!(overlap.is_phased(), "overlap genotypes must be phased");
        assert!(
            overlap.n_markers() <= self.n_markers(),
            "overlap longer than window"
        );
        for m in 0..overlap.n_markers() {
            let idx = MarkerIdx::new(m as u32);
            assert!(
                overlap.markers().marker(idx) == self.markers().marker(idx),
                "overlap marker mismatch at {}",
                m
            );
        }
        TargGt::Spliced(Box::new(SplicedGt {
            overlap,
            targ: self,
        }))
    }

    /// Restrict to the markers with the given (strictly increasing) indices
    pub fn restrict(&self, indices: &[usize]) -> TargGt {
        let markers = self.markers().restrict(indices);
        TargGt::Restricted(Box::new(RestrictedGt {
            inner: self.clone(),
            indices: indices.into(),
            markers,
        }))
    }

    pub fn markers(&self) -> &Markers {
        match self {
            Self::Basic(gt) => &gt.markers,
            Self::Haps(gt) => &gt.markers,
            Self::Restricted(gt) => &gt.markers,
            Self::Spliced(gt) => gt.targ.markers(),
        }
    }

    pub fn samples(&self) -> &Arc<Samples> {
        match self {
            Self::Basic(gt) => &gt.samples,
            Self::Haps(gt) => &gt.samples,
            Self::Restricted(gt) => gt.inner.samples(),
            Self::Spliced(gt) => gt.targ.samples(),
        }
    }

    pub fn n_markers(&self) -> usize {
        self.markers().len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples().len()
    }

    pub fn n_haps(&self) -> usize {
        self.samples().n_haps()
    }

    /// True if every genotype is phased and non-missing
    pub fn is_phased(&self) -> bool {
        match self {
            Self::Basic(gt) => gt.all_phased,
            Self::Haps(_) => true,
            Self::Restricted(gt) => gt.inner.is_phased(),
            Self::Spliced(gt) => {
                gt.overlap.n_markers() == gt.targ.n_markers() || gt.targ.is_phased()
            }
        }
    }

    /// First allele of the sample's genotype (`MISSING_ALLELE` if missing)
    #[inline]
    pub fn allele1(&self, m: MarkerIdx, s: SampleIdx) -> u8 {
        match self {
            Self::Basic(gt) => gt.recs[m.as_usize()].allele1(s),
            Self::Haps(gt) => gt.allele(m, s.hap1()),
            Self::Restricted(gt) => gt
                .inner
                .allele1(MarkerIdx::new(gt.indices[m.as_usize()] as u32), s),
            Self::Spliced(gt) => {
                if m.as_usize() < gt.overlap.n_markers() {
                    gt.overlap.allele1(m, s)
                } else {
                    gt.targ.allele1(m, s)
                }
            }
        }
    }

    /// Second allele of the sample's genotype (`MISSING_ALLELE` if missing)
    #[inline]
    pub fn allele2(&self, m: MarkerIdx, s: SampleIdx) -> u8 {
        match self {
            Self::Basic(gt) => gt.recs[m.as_usize()].allele2(s),
            Self::Haps(gt) => gt.allele(m, s.hap2()),
            Self::Restricted(gt) => gt
                .inner
                .allele2(MarkerIdx::new(gt.indices[m.as_usize()] as u32), s),
            Self::Spliced(gt) => {
                if m.as_usize() < gt.overlap.n_markers() {
                    gt.overlap.allele2(m, s)
                } else {
                    gt.targ.allele2(m, s)
                }
            }
        }
    }

    /// Allele carried by a haplotype (`MISSING_ALLELE` if missing)
    #[inline]
    pub fn allele(&self, m: MarkerIdx, h: HapIdx) -> u8 {
        if h.0 & 1 == 0 {
            self.allele1(m, h.sample())
        } else {
            self.allele2(m, h.sample())
        }
    }

    /// True if the sample's genotype at the marker is phased
    pub fn is_phased_gt(&self, m: MarkerIdx, s: SampleIdx) -> bool {
        match self {
            Self::Basic(gt) => gt.recs[m.as_usize()].is_phased(s),
            Self::Haps(_) => true,
            Self::Restricted(gt) => gt
                .inner
                .is_phased_gt(MarkerIdx::new(gt.indices[m.as_usize()] as u32), s),
            Self::Spliced(gt) => {
                if m.as_usize() < gt.overlap.n_markers() {
                    true
                } else {
                    gt.targ.is_phased_gt(m, s)
                }
            }
        }
    }
}

/// Phased, non-missing reference panel genotypes
#[derive(Clone, Debug)]
pub struct RefGt {
    markers: Markers,
    samples: Arc<Samples>,
    recs: Vec<Arc<RefColumn>>,
}

impl RefGt {
    pub fn new(markers: Markers, samples: Arc<Samples>, recs: Vec<Arc<RefColumn>>) -> Self {
        assert_eq!(markers.len(), recs.len(), "marker/record count mismatch");
        Self {
            markers,
            samples,
            recs,
        }
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn samples(&self) -> &Arc<Samples> {
        &self.samples
    }

    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_haps(&self) -> usize {
        self.samples.n_haps()
    }

    pub fn rec(&self, m: MarkerIdx) -> &RefColumn {
        &self.recs[m.as_usize()]
    }

    #[inline]
    pub fn allele(&self, m: MarkerIdx, h: HapIdx) -> u8 {
        self.recs[m.as_usize()].get(h)
    }

    #[inline]
    pub fn allele1(&self, m: MarkerIdx, s: SampleIdx) -> u8 {
        self.allele(m, s.hap1())
    }

    #[inline]
    pub fn allele2(&self, m: MarkerIdx, s: SampleIdx) -> u8 {
        self.allele(m, s.hap2())
    }

    /// Restrict to the markers with the given (strictly increasing) indices
    pub fn restrict(&self, indices: &[usize]) -> RefGt {
        RefGt {
            markers: self.markers.restrict(indices),
            samples: Arc::clone(&self.samples),
            recs: indices.iter().map(|&m| Arc::clone(&self.recs[m])).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::marker::{Allele, ChromIdx, Marker};

    pub(crate) fn test_markers(n: usize) -> Markers {
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for m in 0..n {
            markers.push(Marker::new(
                ChromIdx(0),
                (m as u32 + 1) * 100,
                Vec::new(),
                vec![Allele::Base(0), Allele::Base(1)],
            ));
        }
        markers
    }

    fn test_basic_gt() -> TargGt {
        let markers = test_markers(3);
        let samples = Arc::new(Samples::from_ids(["S1", "S2"]));
        let recs = vec![
            GtRec::new(vec![0, 1], vec![1, 1], vec![false, false]),
            GtRec::new(vec![0, MISSING_ALLELE], vec![0, MISSING_ALLELE], vec![false, false]),
            GtRec::new(vec![1, 0], vec![0, 0], vec![false, false]),
        ];
        TargGt::Basic(Arc::new(BasicGt::new(markers, samples, recs)))
    }

    #[test]
    fn test_basic_access() {
        let gt = test_basic_gt();
        assert_eq!(gt.n_markers(), 3);
        assert_eq!(gt.n_samples(), 2);
        assert_eq!(gt.n_haps(), 4);
        assert!(!gt.is_phased());
        assert_eq!(gt.allele1(MarkerIdx(0), SampleIdx(0)), 0);
        assert_eq!(gt.allele2(MarkerIdx(0), SampleIdx(0)), 1);
        assert_eq!(gt.allele(MarkerIdx(0), HapIdx(2)), 1);
        assert_eq!(gt.allele1(MarkerIdx(1), SampleIdx(1)), MISSING_ALLELE);
    }

    #[test]
    fn test_restricted_view() {
        let gt = test_basic_gt();
        let restricted = gt.restrict(&[0, 2]);
        assert_eq!(restricted.n_markers(), 2);
        assert_eq!(restricted.markers().marker(MarkerIdx(1)).pos, 300);
        assert_eq!(restricted.allele1(MarkerIdx(1), SampleIdx(0)), 1);
    }

    #[test]
    fn test_spliced_view() {
        let gt = test_basic_gt();
        let overlap_markers = Arc::new(gt.markers().restrict_range(0, 1));
        let samples = Arc::clone(gt.samples());
        let haps: Vec<Arc<PackedAlleles>> = [[1u8], [0], [1], [1]]
            .iter()
            .map(|alleles| Arc::new(overlap_markers.alleles_to_bits(&alleles[..])))
            .collect();
        let overlap = TargGt::Haps(HapsGt::new(overlap_markers, samples, haps));

        let spliced = gt.splice(overlap);
        // marker 0 comes from the phased overlap
        assert_eq!(spliced.allele1(MarkerIdx(0), SampleIdx(0)), 1);
        assert_eq!(spliced.allele2(MarkerIdx(0), SampleIdx(0)), 0);
        assert!(spliced.is_phased_gt(MarkerIdx(0), SampleIdx(0)));
        // marker 2 still comes from the unphased target records
        assert_eq!(spliced.allele1(MarkerIdx(2), SampleIdx(0)), 1);
        assert!(!spliced.is_phased());
    }

    #[test]
    fn test_ref_gt_restrict() {
        let markers = test_markers(3);
        let samples = Arc::new(Samples::from_ids(["R1", "R2"]));
        let recs = vec![
            Arc::new(RefColumn::from_alleles(&[0, 1, 0, 1], 2)),
            Arc::new(RefColumn::from_alleles(&[1, 1, 0, 0], 2)),
            Arc::new(RefColumn::from_alleles(&[0, 0, 1, 1], 2)),
        ];
        let ref_gt = RefGt::new(markers, samples, recs);
        assert_eq!(ref_gt.allele(MarkerIdx(1), HapIdx(0)), 1);

        let restricted = ref_gt.restrict(&[1, 2]);
        assert_eq!(restricted.n_markers(), 2);
        assert_eq!(restricted.allele(MarkerIdx(0), HapIdx(0)), 1);
        assert_eq!(restricted.allele(MarkerIdx(1), HapIdx(3)), 1);
    }
}

//! # Reference Genotype Storage Backends
//!
//! Compact storage for phased, non-missing reference records. A record is
//! either bit-packed (dense) or represented by per-allele carrier lists with
//! the major allele omitted (sparse). The tagged enum replaces virtual
//! dispatch in hot loops.

pub mod dense;
pub mod sparse;

pub use dense::DenseRec;
pub use sparse::SparseRec;

use crate::data::haplotype::HapIdx;

/// A phased, non-missing genotype record for all haplotypes at one marker
#[derive(Clone, Debug)]
pub enum RefColumn {
    /// Packed allele bits for every haplotype
    Dense(DenseRec),
    /// Major allele plus sorted carrier lists for each minor allele
    Sparse(SparseRec),
}

impl RefColumn {
    /// Threshold carrier fraction below which the sparse representation
    /// is chosen by `from_alleles`.
    const SPARSE_FRACTION: f64 = 0.01;

    /// Get allele for a haplotype (0 = REF, 1+ = ALT)
    #[inline]
    pub fn get(&self, hap: HapIdx) -> u8 {
        match self {
            Self::Dense(rec) => rec.get(hap),
            Self::Sparse(rec) => rec.get(hap),
        }
    }

    /// Number of haplotypes in this record
    pub fn n_haplotypes(&self) -> usize {
        match self {
            Self::Dense(rec) => rec.n_haplotypes(),
            Self::Sparse(rec) => rec.n_haplotypes(),
        }
    }

    /// Number of alleles at this record's marker
    pub fn n_alleles(&self) -> usize {
        match self {
            Self::Dense(rec) => rec.n_alleles(),
            Self::Sparse(rec) => rec.n_alleles(),
        }
    }

    /// Create from an allele slice, choosing the representation by
    /// minor-allele frequency.
    ///
    /// # Panics
    /// Panics if any allele index is `>= n_alleles`.
    pub fn from_alleles(alleles: &[u8], n_alleles: usize) -> Self {
        let n_haps = alleles.len();
        let mut counts = vec![0usize; n_alleles];
        for &a in alleles {
            counts[a as usize] += 1;
        }
        let (major, &major_count) = counts
            .iter()
            .enumerate()
            .max_by_key(|&(_, c)| *c)
            .expect("record has no alleles");

        let minor_count = n_haps - major_count;
        if n_haps > 0 && (minor_count as f64) < Self::SPARSE_FRACTION * n_haps as f64 {
            Self::Sparse(SparseRec::from_alleles(alleles, n_alleles, major as u8))
        } else {
            Self::Dense(DenseRec::from_alleles(alleles.iter().copied(), n_alleles))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_representation_selection() {
        let common: Vec<u8> = (0..200).map(|i| (i % 2) as u8).collect();
        assert!(matches!(
            RefColumn::from_alleles(&common, 2),
            RefColumn::Dense(_)
        ));

        let mut rare = vec![0u8; 1000];
        rare[17] = 1;
        let col = RefColumn::from_alleles(&rare, 2);
        assert!(matches!(col, RefColumn::Sparse(_)));
        for (h, &a) in rare.iter().enumerate() {
            assert_eq!(col.get(HapIdx::new(h as u32)), a);
        }
    }

    #[test]
    fn test_sparse_with_major_alt() {
        // ALT is the majority; REF carriers are stored
        let mut alleles = vec![1u8; 500];
        alleles[3] = 0;
        alleles[99] = 0;
        let col = RefColumn::from_alleles(&alleles, 2);
        assert!(matches!(col, RefColumn::Sparse(_)));
        assert_eq!(col.get(HapIdx::new(3)), 0);
        assert_eq!(col.get(HapIdx::new(4)), 1);
    }
}

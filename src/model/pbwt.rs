//! # Positional Burrows-Wheeler Transform
//!
//! Forward and backward updates of Durbin prefix and divergence arrays.
//! Haplotypes with long matching sequence prefixes (forward) or suffixes
//! (backward) end up adjacent in the prefix array, and the divergence
//! array records where each adjacent match starts (forward) or ends
//! (backward).
//!
//! Reference: Durbin, R. (2014) Bioinformatics 30(9):1266-1272.

/// Updates prefix and divergence arrays one step at a time.
///
/// The updater owns per-allele bucket scratch so repeated updates do not
/// allocate.
#[derive(Debug)]
pub struct PbwtUpdater {
    n_haps: usize,
    /// Per-allele buckets of haplotype indices
    a: Vec<Vec<u32>>,
    /// Per-allele buckets of divergence values
    d: Vec<Vec<i32>>,
    /// Divergence propagation values per allele
    p: Vec<i32>,
}

impl PbwtUpdater {
    /// Create an updater for the given number of haplotypes
    pub fn new(n_haps: usize) -> Self {
        let init_alleles = 4;
        Self {
            n_haps,
            a: (0..init_alleles).map(|_| Vec::new()).collect(),
            d: (0..init_alleles).map(|_| Vec::new()).collect(),
            p: vec![0; init_alleles],
        }
    }

    /// Number of haplotypes
    pub fn n_haps(&self) -> usize {
        self.n_haps
    }

    /// Forward update at the given step.
    ///
    /// `seqs[h]` is the coded sequence value of haplotype `h`; all values
    /// must be less than `n_alleles`. `prefix` must be a permutation of
    /// `0..n_haps`, and every `div` value must be `<= step`.
    pub fn fwd_update(
        &mut self,
        seqs: &[u32],
        n_alleles: usize,
        step: i32,
        prefix: &mut [u32],
        div: &mut [i32],
    ) {
        assert!(n_alleles >= 1, "must have at least one allele");
        assert_eq!(prefix.len(), self.n_haps, "prefix length mismatch");
        assert!(div.len() >= self.n_haps, "divergence array too short");
        self.ensure_capacity(n_alleles);
        self.p[..n_alleles].fill(step + 1);

        for i in 0..self.n_haps {
            let hap = prefix[i];
            let allele = seqs[hap as usize] as usize;
            assert!(allele < n_alleles, "sequence value {} out of range", allele);
            for j in 0..n_alleles {
                if div[i] > self.p[j] {
                    self.p[j] = div[i];
                }
            }
            self.a[allele].push(hap);
            self.d[allele].push(self.p[allele]);
            self.p[allele] = i32::MIN;
        }
        self.scatter(n_alleles, prefix, div);
    }

    /// Backward update at the given step.
    ///
    /// Mirror image of `fwd_update`: divergence values record where the
    /// match with the predecessor ends, so minima propagate and every
    /// input `div` value must be `>= step`.
    pub fn bwd_update(
        &mut self,
        seqs: &[u32],
        n_alleles: usize,
        step: i32,
        prefix: &mut [u32],
        div: &mut [i32],
    ) {
        assert!(n_alleles >= 1, "must have at least one allele");
        assert_eq!(prefix.len(), self.n_haps, "prefix length mismatch");
        assert!(div.len() >= self.n_haps, "divergence array too short");
        self.ensure_capacity(n_alleles);
        self.p[..n_alleles].fill(step - 1);

        for i in 0..self.n_haps {
            let hap = prefix[i];
            let allele = seqs[hap as usize] as usize;
            assert!(allele < n_alleles, "sequence value {} out of range", allele);
            for j in 0..n_alleles {
                if div[i] < self.p[j] {
                    self.p[j] = div[i];
                }
            }
            self.a[allele].push(hap);
            self.d[allele].push(self.p[allele]);
            self.p[allele] = i32::MAX;
        }
        self.scatter(n_alleles, prefix, div);
    }

    fn scatter(&mut self, n_alleles: usize, prefix: &mut [u32], div: &mut [i32]) {
        let mut start = 0;
        for al in 0..n_alleles {
            let size = self.a[al].len();
            prefix[start..start + size].copy_from_slice(&self.a[al]);
            div[start..start + size].copy_from_slice(&self.d[al]);
            start += size;
            self.a[al].clear();
            self.d[al].clear();
        }
        debug_assert_eq!(start, self.n_haps);
    }

    fn ensure_capacity(&mut self, n_alleles: usize) {
        if n_alleles > self.a.len() {
            self.a.resize_with(n_alleles, Vec::new);
            self.d.resize_with(n_alleles, Vec::new);
            self.p.resize(n_alleles, 0);
        }
    }
}

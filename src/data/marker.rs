//! # Marker Definitions
//!
//! Genomic marker (variant site) representation and compact allele bit
//! packing for haplotypes.

use bitvec::prelude::*;
use std::sync::Arc;

/// Sentinel allele value for missing data
pub const MISSING_ALLELE: u8 = 255;

/// Zero-cost newtype for interned chromosome indices
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChromIdx(pub u16);

impl ChromIdx {
    pub fn new(idx: u16) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Zero-cost newtype for marker indices
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MarkerIdx(pub u32);

impl MarkerIdx {
    pub fn new(idx: u32) -> Self {
        Self(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for MarkerIdx {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

/// Allele representation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Allele {
    /// Single nucleotide (A=0, C=1, G=2, T=3)
    Base(u8),
    /// Insertion/deletion, symbolic, or multi-base variant
    Seq(Arc<str>),
}

impl Allele {
    /// Create an allele from a string
    pub fn from_str(s: &str) -> Self {
        match s {
            "A" | "a" => Self::Base(0),
            "C" | "c" => Self::Base(1),
            "G" | "g" => Self::Base(2),
            "T" | "t" => Self::Base(3),
            _ => Self::Seq(s.into()),
        }
    }

    /// Check if this is a single nucleotide
    pub fn is_snv(&self) -> bool {
        matches!(self, Self::Base(_))
    }

    fn lex_key(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Base(0) => "A".into(),
            Self::Base(1) => "C".into(),
            Self::Base(2) => "G".into(),
            Self::Base(3) => "T".into(),
            Self::Base(_) => "N".into(),
            Self::Seq(s) => s.as_ref().into(),
        }
    }
}

impl std::fmt::Display for Allele {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lex_key())
    }
}

/// A genomic marker (variant site).
///
/// Equality ignores the identifier list; ordering is chromosome index,
/// position, allele list, END.
#[derive(Clone, Debug)]
pub struct Marker {
    /// Interned chromosome index
    pub chrom: ChromIdx,
    /// 1-based genomic position
    pub pos: u32,
    /// END coordinate for symbolic records, if present
    pub end: Option<u32>,
    /// Variant identifiers (rsIDs or similar)
    pub ids: Vec<Arc<str>>,
    /// Reference allele (first) followed by alternate alleles
    alleles: Vec<Allele>,
}

impl Marker {
    /// Create a new marker.
    ///
    /// # Panics
    /// Panics if `alleles` is empty.
    pub fn new(chrom: ChromIdx, pos: u32, ids: Vec<Arc<str>>, alleles: Vec<Allele>) -> Self {
        assert!(!alleles.is_empty(), "marker must have at least one allele");
        Self {
            chrom,
            pos,
            end: None,
            ids,
            alleles,
        }
    }

    /// Create a marker with an END coordinate
    pub fn with_end(
        chrom: ChromIdx,
        pos: u32,
        end: Option<u32>,
        ids: Vec<Arc<str>>,
        alleles: Vec<Allele>,
    ) -> Self {
        let mut marker = Self::new(chrom, pos, ids, alleles);
        marker.end = end;
        marker
    }

    /// Total number of alleles (ref + alts)
    pub fn n_alleles(&self) -> usize {
        self.alleles.len()
    }

    /// Check if this is a biallelic variant
    pub fn is_biallelic(&self) -> bool {
        self.alleles.len() == 2
    }

    /// Get allele by index (0 = ref, 1+ = alt)
    pub fn allele(&self, idx: usize) -> &Allele {
        &self.alleles[idx]
    }

    /// All alleles, reference first
    pub fn alleles(&self) -> &[Allele] {
        &self.alleles
    }

    /// Number of bits needed to store an allele index
    pub fn bits_per_allele(&self) -> u8 {
        bits_for_alleles(self.n_alleles())
    }
}

/// Bits needed to encode an allele index for `n_alleles` alleles
fn bits_for_alleles(n_alleles: usize) -> u8 {
    if n_alleles <= 2 {
        1
    } else {
        (usize::BITS - (n_alleles - 1).leading_zeros()) as u8
    }
}

impl PartialEq for Marker {
    fn eq(&self, other: &Self) -> bool {
        self.chrom == other.chrom
            && self.pos == other.pos
            && self.end == other.end
            && self.alleles == other.alleles
    }
}

impl Eq for Marker {}

impl PartialOrd for Marker {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Marker {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match self.chrom.cmp(&other.chrom) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match self.pos.cmp(&other.pos) {
            Ordering::Equal => {}
            ord => return ord,
        }
        let n = self.alleles.len().min(other.alleles.len());
        for j in 0..n {
            match self.alleles[j].lex_key().cmp(&other.alleles[j].lex_key()) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        match self.alleles.len().cmp(&other.alleles.len()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.end.cmp(&other.end)
    }
}

/// Packed allele bits for one haplotype over a `Markers` list
pub type PackedAlleles = BitVec<u64, Lsb0>;

/// Process-wide chromosome name interner shared by all input readers so
/// that `ChromIdx` values are comparable across files.
#[derive(Clone, Debug, Default)]
pub struct ChromRegistry {
    names: Vec<Arc<str>>,
}

impl ChromRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a chromosome name and return its index
    pub fn get_or_insert(&mut self, name: &str) -> ChromIdx {
        for (i, existing) in self.names.iter().enumerate() {
            if existing.as_ref() == name {
                return ChromIdx::new(i as u16);
            }
        }
        let idx = ChromIdx::new(self.names.len() as u16);
        self.names.push(name.into());
        idx
    }

    /// Index of an already-interned name
    pub fn index_of(&self, name: &str) -> Option<ChromIdx> {
        self.names
            .iter()
            .position(|n| n.as_ref() == name)
            .map(|i| ChromIdx::new(i as u16))
    }

    /// Snapshot of the interned names
    pub fn names(&self) -> Vec<Arc<str>> {
        self.names.clone()
    }
}

/// An ordered collection of markers with precomputed allele bit layout
#[derive(Clone, Debug, Default)]
pub struct Markers {
    /// The markers in order
    markers: Vec<Marker>,
    /// Chromosome names (indexed by ChromIdx)
    chrom_names: Vec<Arc<str>>,
    /// Start bit of each marker's allele field in a packed haplotype
    bit_starts: Vec<u32>,
    /// Total number of bits in a packed haplotype
    sum_haplotype_bits: u32,
}

impl Markers {
    /// Create an empty marker collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from a vector of markers and chromosome names
    pub fn from_vec(markers: Vec<Marker>, chrom_names: Vec<Arc<str>>) -> Self {
        let mut m = Self {
            markers,
            chrom_names,
            bit_starts: Vec::new(),
            sum_haplotype_bits: 0,
        };
        m.rebuild_bit_layout();
        m
    }

    fn rebuild_bit_layout(&mut self) {
        self.bit_starts.clear();
        self.bit_starts.reserve(self.markers.len());
        let mut start = 0u32;
        for marker in &self.markers {
            self.bit_starts.push(start);
            start += marker.bits_per_allele() as u32;
        }
        self.sum_haplotype_bits = start;
    }

    /// Number of markers
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Get marker by index
    pub fn marker(&self, idx: MarkerIdx) -> &Marker {
        &self.markers[idx.as_usize()]
    }

    /// Bits per allele for the marker with the given index
    pub fn bits_per_allele(&self, idx: MarkerIdx) -> u8 {
        self.markers[idx.as_usize()].bits_per_allele()
    }

    /// Total number of bits required to pack one haplotype
    pub fn sum_haplotype_bits(&self) -> u32 {
        self.sum_haplotype_bits
    }

    /// Get chromosome name by index
    pub fn chrom_name(&self, idx: ChromIdx) -> &str {
        &self.chrom_names[idx.as_usize()]
    }

    /// Add a chromosome name and return its index
    pub fn add_chrom(&mut self, name: &str) -> ChromIdx {
        for (i, existing) in self.chrom_names.iter().enumerate() {
            if existing.as_ref() == name {
                return ChromIdx::new(i as u16);
            }
        }
        let idx = ChromIdx::new(self.chrom_names.len() as u16);
        self.chrom_names.push(name.into());
        idx
    }

    /// Add a marker
    pub fn push(&mut self, marker: Marker) {
        self.bit_starts.push(self.sum_haplotype_bits);
        self.sum_haplotype_bits += marker.bits_per_allele() as u32;
        self.markers.push(marker);
    }

    /// Iterate over markers
    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.iter()
    }

    /// Get all chromosome names
    pub fn chrom_names(&self) -> &[Arc<str>] {
        &self.chrom_names
    }

    /// Restrict to a contiguous range of markers
    pub fn restrict_range(&self, start: usize, end: usize) -> Self {
        Self::from_vec(self.markers[start..end].to_vec(), self.chrom_names.clone())
    }

    /// Restrict to the markers with the given (strictly increasing) indices
    pub fn restrict(&self, indices: &[usize]) -> Self {
        let markers = indices.iter().map(|&m| self.markers[m].clone()).collect();
        Self::from_vec(markers, self.chrom_names.clone())
    }

    /// Pack an allele vector into a compact bit array.
    ///
    /// # Panics
    /// Panics if `alleles.len() != self.len()` or any allele index is out of
    /// range for its marker.
    pub fn alleles_to_bits(&self, alleles: &[u8]) -> PackedAlleles {
        assert_eq!(alleles.len(), self.markers.len(), "allele length mismatch");
        let mut bits = bitvec![u64, Lsb0; 0; self.sum_haplotype_bits as usize];
        for (m, &allele) in alleles.iter().enumerate() {
            let marker = &self.markers[m];
            assert!(
                (allele as usize) < marker.n_alleles(),
                "allele {} out of range at marker {}",
                allele,
                m
            );
            let start = self.bit_starts[m] as usize;
            let width = marker.bits_per_allele() as usize;
            for b in 0..width {
                if (allele >> b) & 1 == 1 {
                    bits.set(start + b, true);
                }
            }
        }
        bits
    }

    /// Unpack the allele stored for one marker in a packed bit array
    #[inline]
    pub fn bits_to_allele(&self, bits: &BitSlice<u64, Lsb0>, m: MarkerIdx) -> u8 {
        let idx = m.as_usize();
        let start = self.bit_starts[idx] as usize;
        let width = self.markers[idx].bits_per_allele() as usize;
        let mut allele = 0u8;
        for b in 0..width {
            if bits[start + b] {
                allele |= 1 << b;
            }
        }
        allele
    }

    /// Unpack a full allele vector from a packed bit array
    pub fn bits_to_alleles(&self, bits: &BitSlice<u64, Lsb0>) -> Vec<u8> {
        (0..self.markers.len())
            .map(|m| self.bits_to_allele(bits, MarkerIdx::new(m as u32)))
            .collect()
    }
}

impl std::ops::Index<MarkerIdx> for Markers {
    type Output = Marker;

    fn index(&self, idx: MarkerIdx) -> &Self::Output {
        &self.markers[idx.as_usize()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snv(chrom: ChromIdx, pos: u32, n_alleles: usize) -> Marker {
        let alleles = (0..n_alleles as u8).map(Allele::Base).collect();
        Marker::new(chrom, pos, Vec::new(), alleles)
    }

    #[test]
    fn test_bits_per_allele() {
        assert_eq!(snv(ChromIdx(0), 1, 2).bits_per_allele(), 1);
        assert_eq!(snv(ChromIdx(0), 1, 3).bits_per_allele(), 2);
        assert_eq!(snv(ChromIdx(0), 1, 4).bits_per_allele(), 2);
        let five = Marker::new(
            ChromIdx(0),
            1,
            Vec::new(),
            vec![
                Allele::Base(0),
                Allele::Base(1),
                Allele::Base(2),
                Allele::Base(3),
                Allele::from_str("AT"),
            ],
        );
        assert_eq!(five.bits_per_allele(), 3);
    }

    #[test]
    fn test_equality_ignores_ids() {
        let mut a = snv(ChromIdx(0), 100, 2);
        let mut b = snv(ChromIdx(0), 100, 2);
        a.ids = vec!["rs1".into()];
        b.ids = vec!["rs2".into()];
        assert_eq!(a, b);
    }

    #[test]
    fn test_ordering() {
        let a = snv(ChromIdx(0), 100, 2);
        let b = snv(ChromIdx(0), 200, 2);
        let c = snv(ChromIdx(1), 50, 2);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        markers.push(snv(ChromIdx(0), 100, 2));
        markers.push(snv(ChromIdx(0), 200, 4));
        markers.push(snv(ChromIdx(0), 300, 3));
        markers.push(snv(ChromIdx(0), 400, 2));
        assert_eq!(markers.sum_haplotype_bits(), 1 + 2 + 2 + 1);

        let alleles = vec![1u8, 3, 2, 0];
        let bits = markers.alleles_to_bits(&alleles);
        assert_eq!(markers.bits_to_alleles(&bits), alleles);
    }

    #[test]
    fn test_round_trip_exhaustive_small() {
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        markers.push(snv(ChromIdx(0), 100, 3));
        markers.push(snv(ChromIdx(0), 200, 2));
        for a0 in 0..3u8 {
            for a1 in 0..2u8 {
                let alleles = vec![a0, a1];
                let bits = markers.alleles_to_bits(&alleles);
                assert_eq!(markers.bits_to_alleles(&bits), alleles);
            }
        }
    }

    #[test]
    fn test_restrict() {
        let mut markers = Markers::new();
        markers.add_chrom("chr1");
        for pos in [100, 200, 300, 400, 500] {
            markers.push(snv(ChromIdx(0), pos, 2));
        }
        let restricted = markers.restrict(&[0, 2, 4]);
        assert_eq!(restricted.len(), 3);
        assert_eq!(restricted.marker(MarkerIdx(1)).pos, 300);
    }
}

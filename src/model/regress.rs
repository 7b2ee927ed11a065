//! # Recombination-Factor Regression
//!
//! `Regress` accumulates (x, y) observations in lock-free adders and fits
//! the ordinary-least-squares slope. `RecombRegress` produces the
//! observations: for randomly drawn samples it runs the forward/backward
//! HMM and records, per marker, the genetic distance against the estimated
//! probability of switching reference haplotypes.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::marker::MarkerIdx;
use crate::model::est_phase::EstPhase;
use crate::model::hmm::HmmUpdater;
use crate::model::phase_data::PhaseData;
use crate::model::phase_ibs::IbsHaps;
use crate::model::phase_states::PhaseStates;

/// Lock-free accumulator for simple linear regression.
///
/// Concurrent `add` calls are permitted; `beta()` is accurate in the
/// absence of concurrent updates (it is only read at iteration barriers).
#[derive(Debug, Default)]
pub struct Regress {
    cnt: AtomicU64,
    sum_x: AtomicU64,
    sum_y: AtomicU64,
    sum_xx: AtomicU64,
    sum_xy: AtomicU64,
}

/// Add to an f64 stored in an AtomicU64 via compare-exchange
fn atomic_add_f64(cell: &AtomicU64, v: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + v).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

impl Regress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of the independent and dependent variables
    pub fn add(&self, x: f64, y: f64) {
        self.cnt.fetch_add(1, Ordering::Relaxed);
        atomic_add_f64(&self.sum_x, x);
        atomic_add_f64(&self.sum_y, y);
        atomic_add_f64(&self.sum_xx, x * x);
        atomic_add_f64(&self.sum_xy, x * y);
    }

    /// Merge another accumulator into this one
    pub fn add_all(&self, other: &Regress) {
        self.cnt.fetch_add(other.cnt(), Ordering::Relaxed);
        atomic_add_f64(&self.sum_x, other.sum_x());
        atomic_add_f64(&self.sum_y, other.sum_y());
        atomic_add_f64(&self.sum_xx, other.sum_xx());
        atomic_add_f64(&self.sum_xy, other.sum_xy());
    }

    pub fn cnt(&self) -> u64 {
        self.cnt.load(Ordering::Relaxed)
    }

    pub fn sum_x(&self) -> f64 {
        f64::from_bits(self.sum_x.load(Ordering::Relaxed))
    }

    pub fn sum_y(&self) -> f64 {
        f64::from_bits(self.sum_y.load(Ordering::Relaxed))
    }

    pub fn sum_xx(&self) -> f64 {
        f64::from_bits(self.sum_xx.load(Ordering::Relaxed))
    }

    pub fn sum_xy(&self) -> f64 {
        f64::from_bits(self.sum_xy.load(Ordering::Relaxed))
    }

    /// The ordinary-least-squares regression slope
    pub fn beta(&self) -> f64 {
        let n = self.cnt() as f64;
        let sx = self.sum_x();
        let sy = self.sum_y();
        let sxx = self.sum_xx();
        let sxy = self.sum_xy();
        (n * sxy - sx * sy) / (n * sxx - sx * sx)
    }
}

/// Per-worker collector of recombination regression data.
///
/// Not thread-safe; each worker owns one instance and pushes observations
/// into a shared `Regress`.
pub struct RecombRegress<'a, 'f> {
    pd: &'a PhaseData<'f>,
    n_markers: usize,
    states: PhaseStates<'a, 'f>,
    hmm: HmmUpdater,
    regress: &'a Regress,

    hap1: Vec<i32>,
    hap2: Vec<i32>,
    ref_al: Vec<Vec<i32>>,
    al_match1: Vec<Vec<u8>>,
    al_match2: Vec<Vec<u8>>,
    fwd: Vec<f32>,
    fwd_m1: Vec<f32>,
    bwd: Vec<f32>,
    saved_bwd: Vec<Vec<f32>>,

    sum_y: f64,
    n_states: usize,
}

impl<'a, 'f> RecombRegress<'a, 'f> {
    pub fn new(pd: &'a PhaseData<'f>, regress: &'a Regress) -> Self {
        let n_markers = pd.n_markers();
        let max_states = pd.max_phase_states();
        Self {
            pd,
            n_markers,
            states: PhaseStates::new(pd, max_states),
            hmm: HmmUpdater::new(pd.err()),
            regress,
            hap1: vec![0; n_markers],
            hap2: vec![0; n_markers],
            ref_al: Vec::new(),
            al_match1: vec![vec![0u8; max_states]; n_markers],
            al_match2: vec![vec![0u8; max_states]; n_markers],
            fwd: vec![0.0; max_states],
            fwd_m1: vec![0.0; max_states],
            bwd: vec![0.0; max_states],
            saved_bwd: vec![vec![0.0; max_states]; n_markers],
            sum_y: 0.0,
            n_states: 0,
        }
    }

    /// Sum of the recorded y-values (switch probabilities)
    pub fn sum_y(&self) -> f64 {
        self.sum_y
    }

    /// Record regression data for one sample
    pub fn update(&mut self, sample: u32, est: &EstPhase, ibs: &dyn IbsHaps) {
        est.get_haps_i32(sample, &mut self.hap1, &mut self.hap2);
        self.n_states = self.states.ibs_states(
            ibs,
            sample,
            &self.hap1,
            &self.hap2,
            &mut self.ref_al,
            &mut self.al_match1,
            &mut self.al_match2,
        );
        self.update_channel(true);
        self.update_channel(false);
    }

    fn update_channel(&mut self, first: bool) {
        let n_states = self.n_states;
        let n_markers = self.n_markers;
        if n_markers < 2 || n_states < 2 {
            return;
        }
        let al_match = if first { &self.al_match1 } else { &self.al_match2 };

        self.bwd[..n_states].fill(1.0);
        self.saved_bwd[n_markers - 1][..n_states].fill(1.0);
        for m in (0..n_markers - 1).rev() {
            let m_p1 = m + 1;
            self.hmm.bwd_update(
                &mut self.bwd,
                self.pd.p_recomb(m_p1),
                &al_match[m_p1],
                n_states,
            );
            self.saved_bwd[m][..n_states].copy_from_slice(&self.bwd[..n_states]);
        }

        let h_factor = n_states as f32 / (n_states as f32 - 1.0);
        self.fwd[..n_states].fill(1.0 / n_states as f32);
        let mut last_sum =
            self.hmm
                .fwd_update(&mut self.fwd, 1.0, self.pd.p_recomb(0), &al_match[0], n_states);
        for m in 1..n_markers {
            let p_switch = self.pd.p_recomb(m);
            let f = ((1.0 - p_switch) + p_switch / n_states as f32) / last_sum;

            self.fwd_m1[..n_states].copy_from_slice(&self.fwd[..n_states]);
            last_sum =
                self.hmm
                    .fwd_update(&mut self.fwd, last_sum, p_switch, &al_match[m], n_states);

            let stored_bwd = &self.saved_bwd[m];
            let mut part_numer = 0.0f32;
            let mut denom = 0.0f32;
            for k in 0..n_states {
                part_numer += self.hmm.emit(al_match[m][k]) * f * self.fwd_m1[k] * stored_bwd[k];
                denom += self.fwd[k] * stored_bwd[k];
            }
            let num = denom - part_numer;
            let x = self.pd.gen_dist(MarkerIdx::new(m as u32));
            let y = (h_factor * num / denom) as f64;
            self.regress.add(x, y);
            self.sum_y += y;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beta_closed_form() {
        // slope from the Wikipedia simple-linear-regression example
        let x = [
            1.47, 1.50, 1.52, 1.55, 1.57, 1.60, 1.63, 1.65, 1.68, 1.70, 1.73, 1.75, 1.78, 1.80,
            1.83,
        ];
        let y = [
            52.21, 53.12, 54.48, 55.84, 57.20, 58.57, 59.93, 61.29, 63.11, 64.47, 66.28, 68.10,
            69.92, 72.19, 74.46,
        ];
        let regress = Regress::new();
        for (xv, yv) in x.iter().zip(y.iter()) {
            regress.add(*xv, *yv);
        }
        assert!((regress.beta() - 61.272).abs() < 0.01);
    }

    #[test]
    fn test_merge_equals_union() {
        let a = Regress::new();
        let b = Regress::new();
        let union = Regress::new();
        for j in 0..10 {
            let x = j as f64 * 0.1;
            let y = 2.0 * x + 0.05 * (j % 3) as f64;
            if j % 2 == 0 {
                a.add(x, y);
            } else {
                b.add(x, y);
            }
            union.add(x, y);
        }
        a.add_all(&b);
        assert_eq!(a.cnt(), union.cnt());
        assert!((a.sum_x() - union.sum_x()).abs() < 1e-12);
        assert!((a.sum_xy() - union.sum_xy()).abs() < 1e-12);
        assert!((a.beta() - union.beta()).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_beta_not_finite() {
        let regress = Regress::new();
        regress.add(1.0, 2.0);
        regress.add(1.0, 3.0);
        // zero x-variance: the slope is undefined and the caller must
        // leave the recombination factor unchanged
        assert!(!regress.beta().is_finite());
    }

    #[test]
    fn test_concurrent_adds() {
        let regress = Regress::new();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let regress = &regress;
                scope.spawn(move || {
                    for j in 0..1000 {
                        let x = (t * 1000 + j) as f64 * 1e-3;
                        regress.add(x, 3.0 * x);
                    }
                });
            }
        });
        assert_eq!(regress.cnt(), 4000);
        assert!((regress.beta() - 3.0).abs() < 1e-9);
    }
}

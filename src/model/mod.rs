//! # Model Module
//!
//! The statistical machinery of the phasing engine: PBWT sweeps, coded
//! steps, IBS2 detection, composite state construction, and the
//! Li-Stephens HMM passes.

pub mod best_match;
pub mod coded_steps;
pub mod est_phase;
pub mod fixed_phase_data;
pub mod fwd_bwd;
pub mod hap_imputer;
pub mod hmm;
pub mod ibs2;
pub mod impute_baum;
pub mod pbwt;
pub mod phase_baum;
pub mod phase_data;
pub mod phase_ibs;
pub mod phase_states;
pub mod regress;

pub use best_match::{BestMatch, LowFreqPhaseIbs};
pub use coded_steps::CodedSteps;
pub use est_phase::{AlleleImputer, EstPhase, SampleUpdate};
pub use fixed_phase_data::{Carriers, FixedPhaseData};
pub use fwd_bwd::FwdBwd;
pub use hap_imputer::{HapImputer, PartlyImputedAllele};
pub use hmm::HmmUpdater;
pub use ibs2::{Ibs2, SampleSeg};
pub use impute_baum::{ImputeBaum, SampleImputation};
pub use pbwt::PbwtUpdater;
pub use phase_baum::PhaseBaum1;
pub use phase_data::PhaseData;
pub use phase_ibs::{IbsHaps, PbwtPhaseIbs};
pub use phase_states::PhaseStates;
pub use regress::{RecombRegress, Regress};

//! State Builder: market/portfolio snapshot to fixed-length feature vector.

mod builder;
mod chain;
mod indicators;

pub use builder::{DegradedField, FeatureVector, StateBuilder, FEATURE_NAMES, FEATURE_VERSION, STATE_DIM};
pub use chain::{max_pain, put_call_ratios, GammaProfile, PutCallRatios};

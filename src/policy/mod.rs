//! Allocation policy: Gaussian actor, twin critics and the SAC trainer.
//!
//! Inference reads an immutable [`PolicySnapshot`] from the
//! [`ParameterStore`]; only the learner mutates parameters.

mod actor;
mod critic;
mod network;
mod params;
mod trainer;

pub use actor::{ActorSample, GaussianActor, LOG_STD_MAX, LOG_STD_MIN};
pub use critic::Critic;
pub use network::{Adam, Mlp};
pub use params::{Checkpoint, ParameterStore, PolicySnapshot, SacNetworks};
pub use trainer::{LearnReport, SacTrainer};

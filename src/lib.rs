//! # Meta Allocator
//!
//! Reinforcement-learning meta-allocator that splits risk budget across
//! fixed strategy groups of an index-options trading system, under a
//! rule-based safety supervisor.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Inbound market/portfolio snapshots and snapshot sources
//! - `state`: State Builder (snapshot to normalized feature vector)
//! - `policy`: Gaussian actor, twin critics, SAC trainer and parameter snapshots
//! - `allocation`: Strategy group table and the Constraint Projector
//! - `reward`: Risk-adjusted reward calculation
//! - `replay`: Prioritized replay store
//! - `risk`: Safety Supervisor and risk events
//! - `engine`: Decision loop, learner task and dispatch boundary
//! - `history`: Offline transition reconstruction and pretraining
//! - `persistence`: SQLite checkpoints, transition archive and risk events
//! - `error`: Error taxonomy

pub mod allocation;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod market;
pub mod persistence;
pub mod policy;
pub mod replay;
pub mod reward;
pub mod risk;
pub mod state;

pub use config::Config;
pub use error::{AllocatorError, AllocatorResult};

//! Decision loop, learner task and the Strategy Zoo dispatch boundary.
//!
//! The loop and the learner communicate only through a bounded transition
//! channel and the versioned [`crate::policy::ParameterStore`].

mod decision_loop;
mod dispatcher;
mod learner;

pub use decision_loop::{ControlCommand, DecisionLoop, LoopMetrics, TickOutcome};
pub use dispatcher::{DispatchReport, PaperDispatcher, StrategyDispatcher};
pub use learner::{restore_trainer, Learner, LearnerSummary};

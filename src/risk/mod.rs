//! Safety Supervisor and risk events.
//!
//! The supervisor runs synchronously after projection and before dispatch and
//! reads only signals already computed for the tick.

mod event;
mod supervisor;

pub use event::{AlertSeverity, Breach, BreachKind, ResumeTrigger, RiskEvent, RiskEventKind};
pub use supervisor::{
    Directive, RiskSignals, SafetySupervisor, SupervisorDecision, SupervisorState,
};

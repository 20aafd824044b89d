//! Strategy groups, allocation vectors and the constraint projector.
//!
//! An [`Allocation`] that violates its invariants cannot be constructed, so
//! nothing invalid can reach the Strategy Zoo.

mod groups;
mod projector;

pub use groups::{
    validate_weights, Allocation, GroupTable, SafeAllocation, StrategyGroup,
    ALLOCATION_TOLERANCE,
};
pub use projector::{softmax, ConstraintProjector, Projection};

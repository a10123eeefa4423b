//! Instrumentation: which operands get recorded, and the code that records them

pub mod operand_size;
pub mod overflow;
pub mod planner;

pub use overflow::{FlagSavingCheck, OverflowCheck, RcxZeroCheck};
pub use planner::{plan_accesses, InjectionPlanner, PlannedAccess};

//! Buffer-full test emitted at the end of every fast path
//!
//! After the cursor is advanced, the fast path adds the buffer's negated end
//! address to it. The sum is zero exactly when the buffer is full. How that
//! zero is tested depends on what the host offers:
//!
//! - [`RcxZeroCheck`]: `lea` + jump-if-rcx-zero. Neither touches the
//!   arithmetic flags, so the application's flags survive untouched.
//! - [`FlagSavingCheck`]: an explicit flag-setting test, with the flags saved
//!   before the sequence and restored after it.

use crate::domain::HostError;
use crate::host::isa::{Label, Meta, Reg, RegClass};
use crate::host::regs::ScratchScope;
use crate::host::HostCapabilities;

pub trait OverflowCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register class the cursor register must come from
    fn cursor_class(&self) -> RegClass {
        RegClass::Counter
    }

    /// Runs before any scratch register is taken.
    ///
    /// # Errors
    /// Reservation failures.
    fn prepare(&self, _scope: &mut ScratchScope<'_>) -> Result<(), HostError> {
        Ok(())
    }

    /// Emits `cursor += negated_end`, then branches to `divert` when the sum
    /// is zero and to `resume` otherwise.
    ///
    /// # Errors
    /// Insertion failures, or a cursor register the test cannot use.
    fn emit(
        &self,
        scope: &mut ScratchScope<'_>,
        cursor: Reg,
        negated_end: Reg,
        divert: Label,
        resume: Label,
    ) -> Result<(), HostError>;
}

fn emit_sum(scope: &mut ScratchScope<'_>, cursor: Reg, negated_end: Reg) -> Result<(), HostError> {
    scope.emit(Meta::Lea { dst: cursor, base: negated_end, index: Some(cursor), disp: 0 })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RcxZeroCheck;

impl OverflowCheck for RcxZeroCheck {
    fn name(&self) -> &'static str {
        "lea+jrcxz"
    }

    fn emit(
        &self,
        scope: &mut ScratchScope<'_>,
        cursor: Reg,
        negated_end: Reg,
        divert: Label,
        resume: Label,
    ) -> Result<(), HostError> {
        if cursor != Reg::Rcx {
            return Err(HostError::BadOperand("jump-if-rcx-zero needs the cursor in rcx"));
        }
        emit_sum(scope, cursor, negated_end)?;
        scope.emit(Meta::JumpIfRcxZero { target: divert })?;
        scope.emit(Meta::Jump { target: resume })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlagSavingCheck;

impl OverflowCheck for FlagSavingCheck {
    fn name(&self) -> &'static str {
        "test+jz (flags saved)"
    }

    fn prepare(&self, scope: &mut ScratchScope<'_>) -> Result<(), HostError> {
        scope.save_flags()
    }

    fn emit(
        &self,
        scope: &mut ScratchScope<'_>,
        cursor: Reg,
        negated_end: Reg,
        divert: Label,
        resume: Label,
    ) -> Result<(), HostError> {
        emit_sum(scope, cursor, negated_end)?;
        scope.emit(Meta::TestZero { reg: cursor })?;
        scope.emit(Meta::JumpIfZf { target: divert })?;
        scope.emit(Meta::Jump { target: resume })
    }
}

/// Picks the flag-safe test when the host has one and the caller wants it
#[must_use]
pub fn select(capabilities: HostCapabilities, prefer_flag_safe: bool) -> Box<dyn OverflowCheck> {
    if capabilities.flag_safe_zero_test && prefer_flag_safe {
        Box::new(RcxZeroCheck)
    } else {
        Box::new(FlagSavingCheck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ilist::{InstrList, Node};
    use crate::host::isa::Instr;

    fn emitted(check: &dyn OverflowCheck) -> Vec<Meta> {
        let mut list = InstrList::from_app(vec![Instr::nop(0x10)]);
        let at = list.app_handles()[0];
        let (divert, resume) = (list.new_label(), list.new_label());
        let mut scope = ScratchScope::open(&mut list, at);
        check.prepare(&mut scope).unwrap();
        let cursor = scope.acquire(check.cursor_class()).unwrap();
        let end = scope.acquire(RegClass::Any).unwrap();
        check.emit(&mut scope, cursor, end, divert, resume).unwrap();
        scope.close().unwrap();
        list.iter()
            .filter_map(|n| match n {
                Node::Meta(m) => Some(*m),
                Node::App(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_rcx_check_never_touches_flags() {
        let metas = emitted(&RcxZeroCheck);
        assert!(metas.iter().any(|m| matches!(m, Meta::JumpIfRcxZero { .. })));
        assert!(!metas.iter().any(|m| matches!(
            m,
            Meta::TestZero { .. } | Meta::SaveFlags { .. } | Meta::RestoreFlags { .. }
        )));
    }

    #[test]
    fn test_flag_saving_check_brackets_test() {
        let metas = emitted(&FlagSavingCheck);
        assert!(matches!(metas.first(), Some(Meta::SaveFlags { .. })));
        assert!(matches!(metas.last(), Some(Meta::RestoreFlags { .. })));
        assert!(metas.iter().any(|m| matches!(m, Meta::TestZero { .. })));
    }

    #[test]
    fn test_select_respects_capability() {
        let no_cap = HostCapabilities { flag_safe_zero_test: false };
        assert_eq!(select(no_cap, true).name(), FlagSavingCheck.name());
        assert_eq!(select(HostCapabilities::default(), true).name(), RcxZeroCheck.name());
        assert_eq!(select(HostCapabilities::default(), false).name(), FlagSavingCheck.name());
    }
}

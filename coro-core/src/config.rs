//! Typed configuration layer: a builder that validates inputs up front and
//! hands back an immutable, already-checked snapshot plus a report of what
//! was checked.
//!
//! Scoped down from the ambient configuration machinery a larger host might
//! carry (no file/remote sources, no hot-reload, no watch callbacks) — just
//! the validate-then-snapshot shape, applied to the NS pool's break/recover
//! policy.

use std::fmt;

use crate::error::CoreError;
use crate::ns::BreakRecoverConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Passed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ValidationFinding {
    check: &'static str,
    state: ValidationState,
    detail: String,
}

impl ValidationFinding {
    fn pass(check: &'static str, detail: impl Into<String>) -> Self {
        Self { check, state: ValidationState::Passed, detail: detail.into() }
    }

    fn fail(check: &'static str, detail: impl Into<String>) -> Self {
        Self { check, state: ValidationState::Failed, detail: detail.into() }
    }

    pub fn check(&self) -> &str {
        self.check
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// The set of checks a builder ran, kept even on success so callers can log
/// or assert against it.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    fn push(&mut self, finding: ValidationFinding) {
        self.findings.push(finding);
    }

    pub fn findings(&self) -> &[ValidationFinding] {
        &self.findings
    }

    pub fn failed_count(&self) -> usize {
        self.findings.iter().filter(|f| f.state == ValidationState::Failed).count()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} checks, {} failed", self.findings.len(), self.failed_count())
    }
}

/// Builds a [`BreakRecoverConfig`] from explicit fields, validating every
/// value against the invariants the pool assumes (non-zero thresholds,
/// percentages in range) before handing back a config the pool can trust
/// unconditionally.
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    base: BreakRecoverConfig,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self { base: BreakRecoverConfig::default() }
    }
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_auto_break_recover(mut self, on: bool) -> Self {
        self.base.enable_auto_break_recover = on;
        self
    }

    pub fn max_fail_marks(mut self, marks: u32) -> Self {
        self.base.max_fail_marks = marks;
        self
    }

    pub fn fail_inc_marks(mut self, marks: u32) -> Self {
        self.base.fail_inc_marks = marks;
        self
    }

    pub fn success_dec_marks(mut self, marks: u32) -> Self {
        self.base.success_dec_marks = marks;
        self
    }

    pub fn max_fail_ms(mut self, ms: u64) -> Self {
        self.base.max_fail_ms = ms;
        self
    }

    pub fn break_timeout_ms(mut self, ms: u64) -> Self {
        self.base.break_timeout_ms = ms;
        self
    }

    pub fn fast_recover(mut self, on: bool) -> Self {
        self.base.fast_recover = on;
        self
    }

    pub fn min_available_percent(mut self, pct: u32) -> Self {
        self.base.min_available_percent = pct;
        self
    }

    pub fn try_another_addr(mut self, on: bool) -> Self {
        self.base.try_another_addr = on;
        self
    }

    /// Validates every field and returns the checked config plus the report
    /// of what was checked. Fails closed: any failed check aborts the build.
    pub fn build(self) -> Result<(BreakRecoverConfig, ValidationReport), CoreError> {
        let mut report = ValidationReport::default();
        let cfg = self.base;

        if cfg.max_fail_marks > 0 {
            report.push(ValidationFinding::pass("max_fail_marks.nonzero", format!("{}", cfg.max_fail_marks)));
        } else {
            report.push(ValidationFinding::fail("max_fail_marks.nonzero", "must be at least 1"));
        }

        if cfg.min_available_percent <= 100 {
            report.push(ValidationFinding::pass("min_available_percent.range", format!("{}", cfg.min_available_percent)));
        } else {
            report.push(ValidationFinding::fail("min_available_percent.range", "must be between 0 and 100"));
        }

        if cfg.break_timeout_ms > 0 {
            report.push(ValidationFinding::pass("break_timeout_ms.nonzero", format!("{}ms", cfg.break_timeout_ms)));
        } else {
            report.push(ValidationFinding::fail("break_timeout_ms.nonzero", "must be greater than 0"));
        }

        if cfg.fail_inc_marks > 0 {
            report.push(ValidationFinding::pass("fail_inc_marks.nonzero", format!("{}", cfg.fail_inc_marks)));
        } else {
            report.push(ValidationFinding::fail("fail_inc_marks.nonzero", "must be at least 1, or failures never accumulate"));
        }

        if report.failed_count() > 0 {
            return Err(CoreError::invalid_input(format!("pool config validation failed: {report}")));
        }
        Ok((cfg, report))
    }
}

//! Per-point record of a run.

use crate::config::IntegrationOrder;

/// One converged operating point, sweep point or accepted time step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Sweep value or end time of the step; `0.0` for a plain operating point.
    pub parameter: f64,
    /// Sweep increment or time step that reached this point.
    pub step: f64,
    /// Integration order; `None` outside transient runs.
    pub order: Option<IntegrationOrder>,
    pub newton_iterations: usize,
    pub lte: Option<f64>,
    /// Attempts discarded before this point was accepted.
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
}

impl RunReport {
    pub fn push(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.records.last()
    }

    pub fn rejected_steps(&self) -> usize {
        self.records.iter().map(|r| r.rejected).sum()
    }

    pub fn newton_iterations(&self) -> usize {
        self.records.iter().map(|r| r.newton_iterations).sum()
    }
}

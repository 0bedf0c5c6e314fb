//! Per-role search accounting. The budget never blocks a query; going
//! over the soft limit converts into a scoring penalty instead, so an
//! advocate that genuinely needs more evidence can still fetch it.

#[derive(Clone, Debug)]
pub struct SearchBudget {
    consumed: u32,
    soft_limit: u32,
    penalty_rate: f64,
}

impl SearchBudget {
    pub fn new(soft_limit: u32, penalty_rate: f64) -> Self {
        Self { consumed: 0, soft_limit, penalty_rate }
    }

    /// Account for one query. Always succeeds; returns the new count.
    pub fn reserve(&mut self) -> u32 {
        self.consumed = self.consumed.saturating_add(1);
        self.consumed
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn penalty(&self) -> f64 {
        self.consumed.saturating_sub(self.soft_limit) as f64 * self.penalty_rate
    }
}

use crate::AlertLevel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// Violated when the value is strictly greater.
    Above(f64),
    /// Violated when the value is strictly less.
    Below(f64),
}

/// Binary alert that fires on the edge into violation and clears on the
/// edge back out. No dead band: a value oscillating across the bound
/// toggles on every sample.
#[derive(Debug, Clone)]
pub struct EdgeAlert {
    bound: Bound,
    active: bool,
}

impl EdgeAlert {
    pub fn new(bound: Bound) -> Self {
        Self { bound, active: false }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update(&mut self, value: f64) -> Option<AlertLevel> {
        let violating = match self.bound {
            Bound::Above(max) => value > max,
            Bound::Below(min) => value < min,
        };
        if violating == self.active {
            return None;
        }
        self.active = violating;
        Some(if violating { AlertLevel::Warning } else { AlertLevel::Ok })
    }
}

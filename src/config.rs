/// How a mass-conservation violation is treated during graph construction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MassCheck {
    /// Fail construction with `GraphSetupError::MassMismatch`.
    #[default]
    Strict,
    /// Log a warning and proceed; aggregation weights by the children's
    /// declared masses.
    Warn,
}

/// Graph construction settings.
///
/// ```
/// use ncg::config::{Config, MassCheck};
///
/// let config = Config::default().mass_tolerance(0.05).mass_check(MassCheck::Warn);
/// assert_eq!(config.tolerance(), 0.05);
/// ```
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Config {
    mass_tolerance: f64,
    mass_check: MassCheck,
}

impl Config {
    /// Relative tolerance used when none is configured: 1 %.
    pub const DEFAULT_MASS_TOLERANCE: f64 = 0.01;

    /// Allowed relative deviation between a parent's declared mass and the sum
    /// of its children's masses. Negative or non-finite values are clamped to 0.
    #[must_use]
    pub fn mass_tolerance(mut self, tolerance: f64) -> Self {
        self.mass_tolerance = if tolerance.is_finite() {
            tolerance.max(0.0)
        } else {
            0.0
        };
        self
    }

    /// Fail fast or warn on mass-conservation violations.
    #[must_use]
    pub fn mass_check(mut self, mode: MassCheck) -> Self {
        self.mass_check = mode;
        self
    }

    /// Configured relative tolerance.
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.mass_tolerance
    }

    /// Configured violation handling.
    #[must_use]
    pub fn check_mode(&self) -> MassCheck {
        self.mass_check
    }

    /// Whether `children_total` is within tolerance of `declared`.
    pub(crate) fn mass_conserved(&self, declared: f64, children_total: f64) -> bool {
        (children_total - declared).abs() <= self.mass_tolerance * declared.abs()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mass_tolerance: Self::DEFAULT_MASS_TOLERANCE,
            mass_check: MassCheck::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_is_relative_to_declared_mass() {
        let config = Config::default();
        assert!(config.mass_conserved(300.0, 300.0));
        assert!(config.mass_conserved(300.0, 302.9));
        assert!(!config.mass_conserved(300.0, 303.5));
        assert!(config.mass_conserved(0.0, 0.0));
        assert!(!config.mass_conserved(0.0, 1e-9));
    }

    #[test]
    fn invalid_tolerances_are_clamped() {
        assert_eq!(Config::default().mass_tolerance(-1.0).tolerance(), 0.0);
        assert_eq!(Config::default().mass_tolerance(f64::NAN).tolerance(), 0.0);
        assert_eq!(Config::default().check_mode(), MassCheck::Strict);
    }
}

//! Function contracts: inferred preconditions on parameters and
//! postconditions on return values, memoized per mangled key.

use super::info::Info;
use super::interval::{IMAX, IMIN};

/// A single inferred requirement on one parameter at call sites.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamConstraint {
    /// Parameter position
    pub index: usize,
    /// Required range
    pub min: i64,
    pub max: i64,
    pub non_zero: bool,
    pub non_nil: bool,
    /// Human-readable cause, e.g. "used as divisor"
    pub reason: String,
}

impl ParamConstraint {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        ParamConstraint {
            index,
            min: IMIN,
            max: IMAX,
            non_zero: false,
            non_nil: false,
            reason: reason.into(),
        }
    }

    /// Whether a caller-side abstract value satisfies this constraint.
    pub fn satisfied_by(&self, info: &Info) -> bool {
        if self.non_zero && !info.non_zero {
            return false;
        }
        if self.non_nil && !info.non_nil {
            return false;
        }
        info.minv >= self.min && info.maxv <= self.max
    }
}

/// The contract of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub pre: Vec<ParamConstraint>,
    /// Join of all return-site abstract values
    pub post: Info,
    /// No impure operation reachable from the body
    pub pure: bool,
}

impl Contract {
    /// The fallback contract used when recursion is detected: unknown result,
    /// no preconditions.
    pub fn unknown() -> Self {
        Contract {
            pre: Vec::new(),
            post: Info::unknown(),
            pure: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_satisfaction() {
        let mut c = ParamConstraint::new(0, "used as divisor");
        c.non_zero = true;

        assert!(c.satisfied_by(&Info::int_const(3)));
        assert!(!c.satisfied_by(&Info::range(0, 10)));
        assert!(c.satisfied_by(&Info::range(1, 10)));
    }

    #[test]
    fn test_range_constraint() {
        let mut c = ParamConstraint::new(1, "used as index");
        c.min = 0;
        c.max = 2;
        assert!(c.satisfied_by(&Info::range(0, 2)));
        assert!(!c.satisfied_by(&Info::range(0, 3)));
        assert!(!c.satisfied_by(&Info::int_const(-1)));
    }
}

//! The prover's abstract value for one variable or expression.

use super::interval::{self, hull, Interval, IMAX, IMIN};

/// Abstract value. When `intervals` is empty the range falls back to
/// `[minv, maxv]`; when non-empty, `minv`/`maxv` are the hull endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    /// Exactly one concrete value is known
    pub known: bool,
    /// The concrete value when `known` (ints, bools as 0/1, chars as code points)
    pub cval: i64,
    pub minv: i64,
    pub maxv: i64,
    /// Disjoint refinement intervals, normalized
    pub intervals: Vec<Interval>,
    pub non_zero: bool,
    pub non_nil: bool,
    pub is_bool: bool,
    pub initialized: bool,
    pub used: bool,
    pub is_array: bool,
    pub is_string: bool,
    pub array_size: i64,
    pub array_size_known: bool,
    /// Abstract value behind a reference, when tracked
    pub ref_value: Option<Box<Info>>,
}

impl Default for Info {
    fn default() -> Self {
        Info {
            known: false,
            cval: 0,
            minv: IMIN,
            maxv: IMAX,
            intervals: Vec::new(),
            non_zero: false,
            non_nil: false,
            is_bool: false,
            initialized: true,
            used: false,
            is_array: false,
            is_string: false,
            array_size: 0,
            array_size_known: false,
            ref_value: None,
        }
    }
}

impl Info {
    /// Completely unknown value.
    pub fn unknown() -> Self {
        Info::default()
    }

    /// A known integer constant.
    pub fn int_const(v: i64) -> Self {
        Info {
            known: true,
            cval: v,
            minv: v,
            maxv: v,
            non_zero: v != 0,
            non_nil: true,
            ..Info::default()
        }
    }

    /// A known boolean constant.
    pub fn bool_const(v: bool) -> Self {
        Info {
            is_bool: true,
            ..Info::int_const(v as i64)
        }
    }

    /// An integer bounded to `[lo, hi]`.
    pub fn range(lo: i64, hi: i64) -> Self {
        let mut info = Info {
            minv: lo,
            maxv: hi,
            non_nil: true,
            ..Info::default()
        };
        if lo == hi {
            info.known = true;
            info.cval = lo;
        }
        if lo > 0 || hi < 0 {
            info.non_zero = true;
        }
        info
    }

    /// An uninitialized slot.
    pub fn uninitialized() -> Self {
        Info {
            initialized: false,
            ..Info::default()
        }
    }

    /// An array with known element count.
    pub fn array_of(len: i64) -> Self {
        Info {
            is_array: true,
            non_nil: true,
            array_size: len,
            array_size_known: true,
            ..Info::default()
        }
    }

    /// A string; when `len` is known it doubles as the index bound.
    pub fn string_of(len: Option<i64>) -> Self {
        Info {
            is_string: true,
            non_nil: true,
            array_size: len.unwrap_or(0),
            array_size_known: len.is_some(),
            ..Info::default()
        }
    }

    /// The effective interval set: refinement intervals, or the hull.
    pub fn effective_intervals(&self) -> Vec<Interval> {
        if self.intervals.is_empty() {
            vec![Interval::new(self.minv, self.maxv)]
        } else {
            self.intervals.clone()
        }
    }

    /// Replace the range with an interval set, restoring the hull invariant
    /// and derived flags.
    pub fn set_intervals(&mut self, intervals: Vec<Interval>) {
        let norm = interval::normalize(intervals);
        if norm.is_empty() {
            // Contradiction on this path; keep the hull empty-ish by pinning
            // to an impossible-to-widen point. Callers treat the path as dead.
            self.known = false;
            self.intervals = Vec::new();
            return;
        }
        let h = hull(&norm);
        self.minv = h.lo;
        self.maxv = h.hi;
        self.intervals = if norm.len() == 1 { Vec::new() } else { norm };
        if self.minv == self.maxv && self.intervals.is_empty() {
            self.known = true;
            self.cval = self.minv;
        } else {
            self.known = false;
        }
        if !self.effective_contains(0) {
            self.non_zero = true;
        }
    }

    /// Whether the effective interval set contains `v`.
    pub fn effective_contains(&self, v: i64) -> bool {
        self.effective_intervals().iter().any(|iv| iv.contains(v))
    }

    /// Whether the range is provably inside `[lo, hi]`.
    pub fn within(&self, lo: i64, hi: i64) -> bool {
        self.minv >= lo && self.maxv <= hi
    }

    /// Pointwise join at a control-flow merge: lower/upper over the hull,
    /// set-union over intervals, AND over non_zero/non_nil/initialized, OR
    /// over used.
    pub fn union_with(&self, other: &Info) -> Info {
        let merged = interval::union(&self.effective_intervals(), &other.effective_intervals());
        let h = hull(&merged);
        let known = self.known && other.known && self.cval == other.cval;
        Info {
            known,
            cval: if known { self.cval } else { 0 },
            minv: h.lo,
            maxv: h.hi,
            intervals: if merged.len() > 1 { merged } else { Vec::new() },
            non_zero: self.non_zero && other.non_zero,
            non_nil: self.non_nil && other.non_nil,
            is_bool: self.is_bool && other.is_bool,
            initialized: self.initialized && other.initialized,
            used: self.used || other.used,
            is_array: self.is_array && other.is_array,
            is_string: self.is_string && other.is_string,
            array_size: if self.array_size_known
                && other.array_size_known
                && self.array_size == other.array_size
            {
                self.array_size
            } else {
                0
            },
            array_size_known: self.array_size_known
                && other.array_size_known
                && self.array_size == other.array_size,
            ref_value: match (&self.ref_value, &other.ref_value) {
                (Some(a), Some(b)) => Some(Box::new(a.union_with(b))),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_invariants() {
        let info = Info::int_const(7);
        assert!(info.known);
        assert!(info.minv <= info.maxv);
        assert!(info.cval >= info.minv && info.cval <= info.maxv);
        assert!(info.non_zero);
    }

    #[test]
    fn test_union_hull() {
        let a = Info::int_const(1);
        let b = Info::int_const(10);
        let u = a.union_with(&b);
        assert!(!u.known);
        assert_eq!((u.minv, u.maxv), (1, 10));
        assert_eq!(u.intervals, vec![Interval::new(1, 1), Interval::new(10, 10)]);
        assert!(u.non_zero);
    }

    #[test]
    fn test_union_same_const_stays_known() {
        let a = Info::int_const(5);
        let u = a.union_with(&Info::int_const(5));
        assert!(u.known);
        assert_eq!(u.cval, 5);
    }

    #[test]
    fn test_set_intervals_restores_hull() {
        let mut info = Info::unknown();
        info.set_intervals(vec![Interval::new(3, 4), Interval::new(8, 9)]);
        assert_eq!((info.minv, info.maxv), (3, 9));
        assert_eq!(info.intervals.len(), 2);
        assert!(info.non_zero);
    }

    #[test]
    fn test_initialized_joins_with_and() {
        let a = Info::int_const(1);
        let b = Info::uninitialized();
        assert!(!a.union_with(&b).initialized);
    }
}

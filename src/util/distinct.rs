//! Approximate-distinct counting with automatic exact→approximate
//! fallback: an exact `HashSet` while the cardinality stays small, handing
//! off to a probabilistic estimator once it grows past a fixed threshold,
//! behind one shared trait so callers don't care which backend is active.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Something that can count approximately-distinct items while bounding its
/// own memory use.
pub trait DistinctCounter {
    fn insert(&mut self, item: &str);
    fn estimate(&self) -> u64;
    fn is_approximate(&self) -> bool;
}

/// Exact counting via a `HashSet`. Used until `memory_bound` items have been
/// seen, then the caller should switch to `Approximate`.
#[derive(Debug, Default)]
pub struct ExactCounter {
    seen: HashSet<String>,
}

impl ExactCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

impl DistinctCounter for ExactCounter {
    fn insert(&mut self, item: &str) {
        self.seen.insert(item.to_string());
    }

    fn estimate(&self) -> u64 {
        self.seen.len() as u64
    }

    fn is_approximate(&self) -> bool {
        false
    }
}

/// A small HyperLogLog variant: `2^precision` byte registers, harmonic-mean
/// cardinality estimate with the standard small-range linear-counting
/// correction. Precision 10-14 is typical; default 12 (4096 registers,
/// ~1.6% standard error).
#[derive(Debug, Clone)]
pub struct HyperLogLog {
    registers: Vec<u8>,
    precision: u32,
}

impl HyperLogLog {
    pub fn new(precision: u32) -> Self {
        let precision = precision.clamp(4, 16);
        Self {
            registers: vec![0u8; 1 << precision],
            precision,
        }
    }

    fn hash(item: &str) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut h);
        h.finish()
    }

    fn alpha(m: usize) -> f64 {
        match m {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m as f64),
        }
    }
}

impl DistinctCounter for HyperLogLog {
    fn insert(&mut self, item: &str) {
        let hash = Self::hash(item);
        let m = self.registers.len() as u64;
        let bucket = (hash & (m - 1)) as usize;
        let rest = hash >> self.precision;
        // Position of the leftmost 1-bit among the remaining bits, +1.
        let rank = if rest == 0 {
            (64 - self.precision) as u8 + 1
        } else {
            (rest.leading_zeros() - self.precision) as u8 + 1
        };
        if rank > self.registers[bucket] {
            self.registers[bucket] = rank;
        }
    }

    fn estimate(&self) -> u64 {
        let m = self.registers.len();
        let sum: f64 = self.registers.iter().map(|&r| 2f64.powi(-(r as i32))).sum();
        let raw = Self::alpha(m) * (m * m) as f64 / sum;

        let zero_registers = self.registers.iter().filter(|&&r| r == 0).count();
        let estimate = if raw <= 2.5 * m as f64 && zero_registers > 0 {
            m as f64 * (m as f64 / zero_registers as f64).ln()
        } else {
            raw
        };
        estimate.round().max(0.0) as u64
    }

    fn is_approximate(&self) -> bool {
        true
    }
}

/// Starts exact, switches to approximate once `memory_bound` distinct items
/// have been observed, switching to an approximate estimate automatically.
pub enum AutoDistinctCounter {
    Exact { inner: ExactCounter, memory_bound: usize },
    Approximate(HyperLogLog),
}

impl AutoDistinctCounter {
    pub fn new(memory_bound: usize, hll_precision: u32) -> Self {
        AutoDistinctCounter::Exact {
            inner: ExactCounter::new(),
            memory_bound,
        }
    }

    fn hll_precision_default() -> u32 {
        12
    }
}

impl DistinctCounter for AutoDistinctCounter {
    fn insert(&mut self, item: &str) {
        match self {
            AutoDistinctCounter::Exact { inner, memory_bound } => {
                inner.insert(item);
                if inner.len() > *memory_bound {
                    let mut hll = HyperLogLog::new(Self::hll_precision_default());
                    for seen in &inner.seen {
                        hll.insert(seen);
                    }
                    *self = AutoDistinctCounter::Approximate(hll);
                }
            }
            AutoDistinctCounter::Approximate(hll) => hll.insert(item),
        }
    }

    fn estimate(&self) -> u64 {
        match self {
            AutoDistinctCounter::Exact { inner, .. } => inner.estimate(),
            AutoDistinctCounter::Approximate(hll) => hll.estimate(),
        }
    }

    fn is_approximate(&self) -> bool {
        matches!(self, AutoDistinctCounter::Approximate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_counter_deduplicates() {
        let mut c = ExactCounter::new();
        c.insert("a");
        c.insert("a");
        c.insert("b");
        assert_eq!(c.estimate(), 2);
        assert!(!c.is_approximate());
    }

    #[test]
    fn hyperloglog_estimate_is_within_tolerance() {
        let mut hll = HyperLogLog::new(12);
        for i in 0..10_000 {
            hll.insert(&format!("item-{i}"));
        }
        let est = hll.estimate() as f64;
        let err = (est - 10_000.0).abs() / 10_000.0;
        assert!(err < 0.1, "relative error too high: {err}");
        assert!(hll.is_approximate());
    }

    #[test]
    fn auto_counter_stays_exact_under_bound() {
        let mut c = AutoDistinctCounter::new(100, 12);
        for i in 0..50 {
            c.insert(&format!("item-{i}"));
        }
        assert_eq!(c.estimate(), 50);
        assert!(!c.is_approximate());
    }

    #[test]
    fn auto_counter_falls_back_to_approximate_over_bound() {
        let mut c = AutoDistinctCounter::new(10, 12);
        for i in 0..1000 {
            c.insert(&format!("item-{i}"));
        }
        assert!(c.is_approximate());
        let err = (c.estimate() as f64 - 1000.0).abs() / 1000.0;
        assert!(err < 0.2);
    }
}

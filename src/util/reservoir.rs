//! Bounded-memory uniform reservoir sampling (Algorithm R), used by the
//! pipeline's rollup path to keep a representative sample of source
//! attribute sets for diagnostics without retaining every source.

pub struct ReservoirSampler<T> {
    capacity: usize,
    items: Vec<T>,
    seen: u64,
}

impl<T> ReservoirSampler<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity),
            seen: 0,
        }
    }

    /// Offer one item from the stream. Uses `rand` (already a crate
    /// dependency) for the replacement draw.
    pub fn offer(&mut self, item: T) {
        self.seen += 1;
        if self.capacity == 0 {
            return;
        }
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let j = rand::Rng::gen_range(&mut rand::thread_rng(), 0..self.seen);
        if (j as usize) < self.capacity {
            self.items[j as usize] = item;
        }
    }

    pub fn samples(&self) -> &[T] {
        &self.items
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.seen = 0;
    }
}

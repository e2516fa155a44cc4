//! Mapping task progress onto operation progress.

/// A sub-range of an operation's 0-100 percent-complete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    start: f64,
    end: f64,
}

impl ProgressRange {
    /// The whole range.
    pub const FULL: ProgressRange = ProgressRange {
        start: 0.0,
        end: 100.0,
    };

    /// Creates a range; bounds are clamped to `[0, 100]` and ordered.
    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 100.0);
        let end = end.clamp(0.0, 100.0);
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// The `index`th of `count` equal slices of `self`.
    pub fn slice(&self, index: usize, count: usize) -> Self {
        let count = count.max(1) as f64;
        let width = (self.end - self.start) / count;
        let index = index as f64;
        Self::new(self.start + width * index, self.start + width * (index + 1.0))
    }

    /// Lower bound.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Upper bound.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Maps a task's own percentage onto this range.
    pub fn map(&self, task_percent: f64) -> f64 {
        let fraction = task_percent.clamp(0.0, 100.0) / 100.0;
        self.start + fraction * (self.end - self.start)
    }
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self::FULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_of_twenty_to_eighty() {
        assert_eq!(ProgressRange::new(20.0, 80.0).map(50.0), 50.0);
    }

    #[test]
    fn bounds_map_to_ends() {
        let r = ProgressRange::new(0.0, 50.0);
        assert_eq!(r.map(0.0), 0.0);
        assert_eq!(r.map(100.0), 50.0);
        assert_eq!(r.map(250.0), 50.0);
    }

    #[test]
    fn slices_cover_the_range() {
        let r = ProgressRange::FULL;
        assert_eq!(r.slice(0, 4), ProgressRange::new(0.0, 25.0));
        assert_eq!(r.slice(3, 4), ProgressRange::new(75.0, 100.0));
        let inner = ProgressRange::new(50.0, 100.0).slice(1, 2);
        assert_eq!(inner, ProgressRange::new(75.0, 100.0));
    }

    #[test]
    fn reversed_bounds_are_ordered() {
        assert_eq!(ProgressRange::new(80.0, 20.0), ProgressRange::new(20.0, 80.0));
    }
}

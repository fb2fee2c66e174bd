//! Where an additional source lands inside a cycle

use crate::models::Interleave;
use rand::Rng;
use tracing::{debug, warn};

/// Normalized insertion rule for one additional source, valid for a fixed cycle length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Fixed(usize),
    /// Start drawn uniformly from `low..=high` every cycle
    Random { low: usize, high: usize },
}

impl Placement {
    /// Clamp the configured range into `[1, cycle_len]`, warning about every correction.
    /// A range that leaves no room for `count` contiguous slots falls back to position 1.
    pub fn new(interleave: &Interleave, cycle_len: usize, label: &str) -> Self {
        let len = cycle_len.max(1) as i64;
        let count = interleave.slots() as i64;

        if interleave.low == interleave.high {
            let mut pos = interleave.low;
            if pos < 1 {
                warn!("{}: insert position {} is below 1, using 1", label, pos);
                pos = 1;
            }
            if pos > len {
                warn!("{}: insert position {} is past cycle length {}, using {}", label, pos, len, len);
                pos = len;
            }
            return Placement::Fixed(pos as usize);
        }

        let (mut low, mut high) = (interleave.low, interleave.high);
        if low < 1 {
            warn!("{}: interleave low {} is below 1, using 1", label, low);
            low = 1;
        }
        if high < low {
            warn!("{}: interleave low {} > high {}, swapping", label, low, high);
            std::mem::swap(&mut low, &mut high);
            low = low.max(1);
        }
        if high > len {
            warn!("{}: interleave high {} is past cycle length {}, using {}", label, high, len, len);
            high = len;
        }

        let upper = high.min(len - count + 1);
        if low > upper {
            debug!("{}: no start in [{}, {}] leaves room for {} slots, using 1", label, low, high, count);
            return Placement::Fixed(1);
        }
        Placement::Random { low: low as usize, high: upper as usize }
    }

    /// Starting position (1-based) for one cycle
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        match *self {
            Placement::Fixed(pos) => pos,
            Placement::Random { low, high } if low == high => low,
            Placement::Random { low, high } => rng.random_range(low..=high),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_fixed_position_is_clamped() {
        assert_eq!(Placement::new(&Interleave::fixed(2, 1), 4, "t"), Placement::Fixed(2));
        assert_eq!(Placement::new(&Interleave::fixed(0, 1), 4, "t"), Placement::Fixed(1));
        assert_eq!(Placement::new(&Interleave::fixed(9, 1), 4, "t"), Placement::Fixed(4));
    }

    #[test]
    fn test_random_range_leaves_room_for_count() {
        let placement = Placement::new(&Interleave { low: 2, high: 10, count: 3 }, 8, "t");
        assert_eq!(placement, Placement::Random { low: 2, high: 6 });
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let pos = placement.pick(&mut rng);
            assert!((2..=6).contains(&pos));
        }
    }

    #[test]
    fn test_inverted_range_is_swapped() {
        let placement = Placement::new(&Interleave { low: 5, high: 2, count: 1 }, 10, "t");
        assert_eq!(placement, Placement::Random { low: 2, high: 5 });
    }

    #[test]
    fn test_oversized_count_falls_back_to_first_position() {
        let placement = Placement::new(&Interleave { low: 2, high: 3, count: 9 }, 5, "t");
        assert_eq!(placement, Placement::Fixed(1));
    }
}

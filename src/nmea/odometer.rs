//! # Mixed-Radix Odometer
//!
//! Counter over a fixed number of digits where each digit has its own radix.
//! The rightmost digit increments fastest and carries into its left
//! neighbour on wraparound, like a mechanical odometer.

/// Mixed-radix counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Odometer {
    digits: Vec<usize>,
    radices: Vec<usize>,
    exhausted: bool,
}

impl Odometer {
    /// Create an odometer with one digit per radix, all starting at zero
    ///
    /// A zero radix yields an odometer with no states at all.
    pub fn new(radices: Vec<usize>) -> Self {
        let exhausted = radices.iter().any(|&radix| radix == 0);
        Self {
            digits: vec![0; radices.len()],
            radices,
            exhausted,
        }
    }

    /// Create an odometer with `width` digits sharing the same radix
    pub fn uniform(width: usize, radix: usize) -> Self {
        Self::new(vec![radix; width])
    }

    /// Current digit values, leftmost first
    pub fn digits(&self) -> &[usize] {
        &self.digits
    }

    /// Number of distinct states, or `None` on overflow
    pub fn total_states(&self) -> Option<usize> {
        self.radices
            .iter()
            .try_fold(1usize, |acc, &radix| acc.checked_mul(radix))
    }

    /// `true` once every state has been visited
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Step to the next state
    ///
    /// # Returns
    ///
    /// * `bool` - `false` if the odometer wrapped around past its last state
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return false;
        }

        for position in (0..self.digits.len()).rev() {
            self.digits[position] += 1;
            if self.digits[position] < self.radices[position] {
                return true;
            }
            self.digits[position] = 0;
        }

        self.exhausted = true;
        false
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let current = self.digits.clone();
        self.advance();
        Some(current)
    }
}

// src/rabin.rs

//! Rabin fingerprints over GF(2).
//!
//! A byte string is read as a polynomial with coefficients in GF(2) and
//! reduced modulo a fixed polynomial `P`. The windowed form only ever covers
//! the last [`WINDOW_SIZE`] bytes, so once the window is full its value
//! depends on those bytes alone and not on where they sit in the stream.
//! Both forms cost a couple of table lookups per byte.

/// Width of the sliding window, in bytes.
pub const WINDOW_SIZE: usize = 48;

/// Default reduction polynomial (degree 53).
pub const DEFAULT_POLYNOMIAL: u64 = 0x3DA3358B4DC173;

/// Smallest and largest polynomial degree the tables can work with.
pub const MIN_DEGREE: u32 = 9;
pub const MAX_DEGREE: u32 = 55;

/// Degree of `p`, or -1 for the zero polynomial.
pub fn degree(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

/// `p mod m` over GF(2).
fn modulo(mut p: u64, m: u64) -> u64 {
    let dm = degree(m);
    while degree(p) >= dm {
        p ^= m << (degree(p) - dm);
    }
    p
}

/// Returns true when `polynomial` can drive a [`RollingFingerprint`].
pub fn is_valid_polynomial(polynomial: u64) -> bool {
    let d = degree(polynomial);
    d >= MIN_DEGREE as i32 && d <= MAX_DEGREE as i32
}

#[derive(Debug, Clone)]
pub struct RollingFingerprint {
    polynomial: u64,
    shift: u32,
    // mod_table[b] = ((b << deg) mod P) | (b << deg): one XOR drops the
    // overflowed top byte and adds back its remainder.
    mod_table: [u64; 256],
    // out_table[b] = (b * x^(8 * (WINDOW_SIZE - 1))) mod P: the contribution
    // of the oldest byte in a full window.
    out_table: [u64; 256],

    window: [u8; WINDOW_SIZE],
    pos: usize,
    filled: usize,
    hash: u64,
}

impl RollingFingerprint {
    /// # Panics
    ///
    /// Panics if the degree of `polynomial` is outside
    /// `MIN_DEGREE..=MAX_DEGREE` (see [`is_valid_polynomial`]).
    pub fn new(polynomial: u64) -> Self {
        assert!(
            is_valid_polynomial(polynomial),
            "polynomial {:#x} has unsupported degree {}",
            polynomial,
            degree(polynomial)
        );
        let k = degree(polynomial) as u32;

        let mut mod_table = [0u64; 256];
        let mut out_table = [0u64; 256];
        for b in 0..256u64 {
            let top = b << k;
            mod_table[b as usize] = modulo(top, polynomial) | top;

            let mut h = modulo(b, polynomial);
            for _ in 0..WINDOW_SIZE - 1 {
                h = modulo(h << 8, polynomial);
            }
            out_table[b as usize] = h;
        }

        RollingFingerprint {
            polynomial,
            shift: k - 8,
            mod_table,
            out_table,
            window: [0; WINDOW_SIZE],
            pos: 0,
            filled: 0,
            hash: 0,
        }
    }

    pub fn polynomial(&self) -> u64 {
        self.polynomial
    }

    /// Clears the window; the hash becomes 0.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.filled = 0;
        self.hash = 0;
    }

    /// Current windowed hash.
    pub fn value(&self) -> u64 {
        self.hash
    }

    /// True once `WINDOW_SIZE` bytes have been rolled in since the last reset.
    pub fn is_full(&self) -> bool {
        self.filled == WINDOW_SIZE
    }

    /// Slides `byte` into the window, evicting the oldest byte once the
    /// window is full, and returns the updated hash.
    #[inline]
    pub fn roll(&mut self, byte: u8) -> u64 {
        if self.filled == WINDOW_SIZE {
            let out = self.window[self.pos];
            self.hash ^= self.out_table[out as usize];
        } else {
            self.filled += 1;
        }
        self.window[self.pos] = byte;
        self.pos = (self.pos + 1) % WINDOW_SIZE;
        self.hash = self.append(self.hash, byte);
        self.hash
    }

    /// Extends a non-windowed fingerprint `acc` by one byte.
    #[inline]
    pub fn append(&self, acc: u64, byte: u8) -> u64 {
        let top = (acc >> self.shift) & 0xff;
        ((acc << 8) | u64::from(byte)) ^ self.mod_table[top as usize]
    }

    /// Non-windowed fingerprint of a whole buffer.
    pub fn fingerprint(&self, data: &[u8]) -> u64 {
        data.iter().fold(0, |acc, &b| self.append(acc, b))
    }
}

impl Default for RollingFingerprint {
    fn default() -> Self {
        RollingFingerprint::new(DEFAULT_POLYNOMIAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_bytes(seed: u32, len: usize) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1103515245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect()
    }

    // Bit-at-a-time reduction, no tables.
    fn slow_fingerprint(data: &[u8], p: u64) -> u64 {
        data.iter().fold(0, |acc, &b| modulo((acc << 8) | u64::from(b), p))
    }

    #[test]
    fn test_degree_and_modulo() {
        assert_eq!(degree(0), -1);
        assert_eq!(degree(1), 0);
        assert_eq!(degree(1 << 7), 7);
        assert_eq!(modulo(7, 4), 3);
        assert_eq!(modulo(19, 8), 3);
        assert_eq!(modulo(16, 8), 0);
    }

    #[test]
    fn test_append_matches_slow_reduction() {
        let rf = RollingFingerprint::default();
        let data = lcg_bytes(7, 500);
        assert_eq!(rf.fingerprint(&data), slow_fingerprint(&data, DEFAULT_POLYNOMIAL));
    }

    #[test]
    fn test_full_window_equals_fingerprint_of_window() {
        let mut rf = RollingFingerprint::default();
        let data = lcg_bytes(42, 1000);
        for (i, &b) in data.iter().enumerate() {
            let h = rf.roll(b);
            if i + 1 >= WINDOW_SIZE {
                let window = &data[i + 1 - WINDOW_SIZE..=i];
                assert_eq!(h, rf.fingerprint(window), "mismatch at byte {}", i);
            }
        }
    }

    #[test]
    fn test_position_independence() {
        let tail = lcg_bytes(3, WINDOW_SIZE);

        let mut a = RollingFingerprint::default();
        for &b in lcg_bytes(1, 333).iter().chain(tail.iter()) {
            a.roll(b);
        }
        let mut b = RollingFingerprint::default();
        for &x in lcg_bytes(2, 17).iter().chain(tail.iter()) {
            b.roll(x);
        }
        assert!(a.is_full() && b.is_full());
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_reset() {
        let mut rf = RollingFingerprint::default();
        for b in 0..100u8 {
            rf.roll(b);
        }
        rf.reset();
        assert_eq!(rf.value(), 0);
        assert!(!rf.is_full());
        assert_eq!(rf.roll(9), rf.fingerprint(&[9]));
    }

    #[test]
    #[should_panic]
    fn test_rejects_oversized_polynomial() {
        RollingFingerprint::new(0xbfe6b8a5bf378d83);
    }
}

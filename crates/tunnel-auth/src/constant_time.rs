//! Constant-time credential comparison (P10): comparing a supplied
//! `authCode`/`secretKey` against the stored value must not leak the
//! position of the first differing byte through timing.

use subtle::ConstantTimeEq;

/// Returns whether `a` and `b` are equal, in time independent of where
/// they first differ. Unequal lengths are rejected up front — this still
/// leaks length, which the wire protocol already reveals.
pub fn credentials_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn equal_strings_match() {
        assert!(credentials_match("super-secret-key", "super-secret-key"));
    }

    #[test]
    fn differing_strings_do_not_match() {
        assert!(!credentials_match("super-secret-key", "super-secret-kex"));
        assert!(!credentials_match("a", "b"));
    }

    #[test]
    fn differing_lengths_do_not_match() {
        assert!(!credentials_match("short", "longer-value"));
    }

    /// Statistical smoke test for P10: comparing against values whose first
    /// differing byte is near the start should take roughly as long as
    /// comparing against values that differ only at the last byte.
    #[test]
    fn compare_time_does_not_depend_on_mismatch_position() {
        let reference: String = "x".repeat(4096);
        let mut early_diff = reference.clone().into_bytes();
        early_diff[0] = b'y';
        let early_diff = String::from_utf8(early_diff).unwrap();
        let mut late_diff = reference.clone().into_bytes();
        *late_diff.last_mut().unwrap() = b'y';
        let late_diff = String::from_utf8(late_diff).unwrap();

        let rounds = 2000;
        let time_early = {
            let start = Instant::now();
            for _ in 0..rounds {
                std::hint::black_box(credentials_match(&reference, &early_diff));
            }
            start.elapsed()
        };
        let time_late = {
            let start = Instant::now();
            for _ in 0..rounds {
                std::hint::black_box(credentials_match(&reference, &late_diff));
            }
            start.elapsed()
        };

        let ratio = time_early.as_secs_f64().max(1e-9) / time_late.as_secs_f64().max(1e-9);
        assert!(
            (0.5..2.0).contains(&ratio),
            "timing ratio {ratio} suggests early vs late mismatch position is distinguishable"
        );
    }
}

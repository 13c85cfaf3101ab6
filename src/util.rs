// Small helpers shared across the collector.

/// Ceiling division, usable in const contexts (page geometry).
pub const fn ceildiv(i: usize, modulus: usize) -> usize {
    (i + modulus - 1) / modulus
}

/// User CPU time in seconds, from getrusage. The profiler wants process
/// time, not wall clock, so that collection cost is attributable.
#[cfg(unix)]
pub fn rusage_time() -> f64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return 0.0;
    }
    usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 * 1e-6
}

#[cfg(not(unix))]
pub fn rusage_time() -> f64 {
    0.0
}

/// Microseconds elapsed since `since` (same clock as `rusage_time`).
pub fn elapsed_musecs(since: f64) -> u64 {
    let now = rusage_time();
    if now <= since {
        0
    } else {
        ((now - since) * 1e6) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceildiv_rounds_up() {
        assert_eq!(ceildiv(0, 8), 0);
        assert_eq!(ceildiv(1, 8), 1);
        assert_eq!(ceildiv(8, 8), 1);
        assert_eq!(ceildiv(9, 8), 2);
    }

    #[test]
    fn rusage_clock_is_monotonic_enough() {
        let a = rusage_time();
        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let b = rusage_time();
        assert!(b >= a);
    }
}

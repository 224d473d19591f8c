use std::time::Instant;

/// Derives instantaneous CPU percentages from the monotonically increasing
/// microsecond counters `cgroup.stat`/`cpu.stat` expose.
///
/// The first sample establishes a baseline and reports zero; every
/// subsequent sample is a delta over the wall-clock interval since the
/// previous one.
#[derive(Debug, Default)]
pub struct CpuTracker {
    last: Option<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    user_usec: u64,
    system_usec: u64,
    total_usec: u64,
    at: Instant,
}

/// The three percentages this tracker derives, each in `[0, 100 * cores]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuPercent {
    pub user_pct: f64,
    pub system_pct: f64,
    pub total_pct: f64,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&mut self, user_usec: u64, system_usec: u64, total_usec: u64) -> CpuPercent {
        let now = Instant::now();
        let sample = Sample {
            user_usec,
            system_usec,
            total_usec,
            at: now,
        };
        let result = match self.last {
            None => CpuPercent::default(),
            Some(last) => {
                let elapsed_usec = now.duration_since(last.at).as_micros() as f64;
                if elapsed_usec <= 0.0 {
                    CpuPercent::default()
                } else {
                    CpuPercent {
                        user_pct: delta_pct(last.user_usec, user_usec, elapsed_usec),
                        system_pct: delta_pct(last.system_usec, system_usec, elapsed_usec),
                        total_pct: delta_pct(last.total_usec, total_usec, elapsed_usec),
                    }
                }
            }
        };
        self.last = Some(sample);
        result
    }
}

fn delta_pct(last: u64, now: u64, elapsed_usec: f64) -> f64 {
    let delta = now.saturating_sub(last) as f64;
    (delta / elapsed_usec) * 100.0
}

/// Converts a `total_pct` reading into a tick-equivalent figure, using the
/// host's clock ticks per core.
pub fn ticks_from_percent(total_pct: f64, ticks_per_core: i64, cores: usize) -> f64 {
    let cores = cores.max(1) as f64;
    0.01 * total_pct * (ticks_per_core as f64 / cores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn first_sample_is_zero() {
        let mut tracker = CpuTracker::new();
        let pct = tracker.percent(1000, 500, 1500);
        assert_eq!(pct, CpuPercent::default());
    }

    #[test]
    fn identical_counters_yield_zero_delta() {
        let mut tracker = CpuTracker::new();
        tracker.percent(1000, 500, 1500);
        sleep(Duration::from_millis(5));
        let pct = tracker.percent(1000, 500, 1500);
        assert_eq!(pct, CpuPercent::default());
    }

    #[test]
    fn monotonic_increase_yields_positive_percentage() {
        let mut tracker = CpuTracker::new();
        tracker.percent(0, 0, 0);
        sleep(Duration::from_millis(50));
        let pct = tracker.percent(25_000, 0, 25_000);
        assert!(pct.total_pct > 0.0);
        assert!(pct.user_pct > 0.0);
        assert_eq!(pct.system_pct, 0.0);
    }

    #[test]
    fn ticks_conversion_scales_by_cores() {
        let one_core = ticks_from_percent(100.0, 100, 1);
        let four_cores = ticks_from_percent(100.0, 100, 4);
        assert_eq!(one_core, 1.0);
        assert_eq!(four_cores, 0.25);
    }
}

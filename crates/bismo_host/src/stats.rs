//! Latency histograms for the emulated run and the generation benchmark.

const BUCKETS: usize = 16;

/// Running min/max/mean of nanosecond latencies plus a fixed-width
/// histogram. Two trackers merge, so per-thread results can be reduced.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub count: u64,
    bucket_ns: u64,
    buckets: [u64; BUCKETS],
}

impl LatencyStats {
    /// `bucket_ns` is the width of each histogram bucket; the last bucket
    /// collects everything beyond.
    pub fn new(bucket_ns: u64) -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
            bucket_ns: bucket_ns.max(1),
            buckets: [0; BUCKETS],
        }
    }

    pub fn update(&mut self, nanos: u64) {
        self.min = self.min.min(nanos);
        self.max = self.max.max(nanos);
        self.sum += nanos;
        self.count += 1;
        let idx = ((nanos / self.bucket_ns) as usize).min(BUCKETS - 1);
        self.buckets[idx] += 1;
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets) {
            *mine += theirs;
        }
        self
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    pub fn print_report(&self, title: &str) {
        println!("\n{}", title);
        println!("Count: {}", self.count);
        if self.count == 0 {
            return;
        }
        let (scale, unit) = if self.avg() < 1000.0 {
            (1.0, "ns")
        } else {
            (1000.0, "us")
        };
        println!("Min:   {:.2} {}", self.min as f64 / scale, unit);
        println!("Avg:   {:.2} {}", self.avg() / scale, unit);
        println!("Max:   {:.2} {}", self.max as f64 / scale, unit);

        println!("Distribution ({} ns buckets):", self.bucket_ns);
        for (i, count) in self.buckets.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let lower = i as u64 * self.bucket_ns;
            if i == BUCKETS - 1 {
                println!("[{:>8}+        ns]: {}", lower, count);
            } else {
                println!("[{:>8}-{:<8} ns]: {}", lower, lower + self.bucket_ns, count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_matches_sequential_updates() {
        let samples = [5u64, 120, 40, 10_000];
        let mut all = LatencyStats::new(100);
        samples.iter().for_each(|s| all.update(*s));

        let mut a = LatencyStats::new(100);
        let mut b = LatencyStats::new(100);
        samples[..2].iter().for_each(|s| a.update(*s));
        samples[2..].iter().for_each(|s| b.update(*s));
        let merged = a.merge(b);

        assert_eq!(merged.min, 5);
        assert_eq!(merged.max, 10_000);
        assert_eq!(merged.count, all.count);
        assert_eq!(merged.buckets, all.buckets);
        assert_eq!(all.buckets[BUCKETS - 1], 1);
    }

    #[test]
    fn empty_average_is_zero() {
        assert_eq!(LatencyStats::new(10).avg(), 0.0);
    }
}

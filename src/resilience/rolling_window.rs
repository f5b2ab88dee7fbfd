//! Sliding Statistics Window
//! Fixed ring of time buckets behind the circuit breaker's error rate

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// One time slice of call outcomes.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub timestamp: Instant,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub response_times: Vec<Duration>,
}

impl Bucket {
    fn new(timestamp: Instant) -> Self {
        Self {
            timestamp,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            response_times: Vec::new(),
        }
    }
}

/// Totals across every bucket currently in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowTotals {
    pub request_count: u64,
    pub error_count: u64,
    pub success_count: u64,
    pub timeout_count: u64,
    pub error_percentage: f64,
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Window length is `bucket_num * bucket_size`; the back bucket is current.
#[derive(Debug)]
pub struct RollingWindow {
    buckets: VecDeque<Bucket>,
    bucket_num: usize,
}

impl RollingWindow {
    pub fn new(bucket_num: usize) -> Self {
        let bucket_num = bucket_num.max(1);
        let mut window = Self {
            buckets: VecDeque::with_capacity(bucket_num),
            bucket_num,
        };
        window.fill();
        window
    }

    fn fill(&mut self) {
        let now = Instant::now();
        while self.buckets.len() < self.bucket_num {
            self.buckets.push_back(Bucket::new(now));
        }
    }

    /// Drop the oldest bucket and open a fresh current one.
    pub fn rotate(&mut self) {
        self.buckets.pop_front();
        self.buckets.push_back(Bucket::new(Instant::now()));
    }

    pub fn record(&mut self, outcome: Outcome, elapsed: Duration) {
        if self.buckets.is_empty() {
            self.fill();
        }
        let Some(bucket) = self.buckets.back_mut() else {
            return;
        };

        match outcome {
            Outcome::Success => bucket.success_count += 1,
            Outcome::Failure => bucket.failure_count += 1,
            Outcome::Timeout => bucket.timeout_count += 1,
        }
        bucket.response_times.push(elapsed);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.fill();
    }

    /// Unweighted sum of every bucket in the window.
    pub fn aggregate(&self) -> WindowTotals {
        let mut totals = WindowTotals::default();
        let mut response_total = Duration::ZERO;
        let mut response_samples: u64 = 0;

        for bucket in &self.buckets {
            totals.success_count += bucket.success_count;
            totals.timeout_count += bucket.timeout_count;
            totals.error_count += bucket.failure_count + bucket.timeout_count;
            response_samples += bucket.response_times.len() as u64;
            response_total += bucket.response_times.iter().sum::<Duration>();
        }

        totals.request_count = totals.success_count + totals.error_count;
        if totals.request_count > 0 {
            totals.error_percentage =
                totals.error_count as f64 / totals.request_count as f64 * 100.0;
        }
        if response_samples > 0 {
            totals.avg_response_time_ms =
                response_total.as_secs_f64() * 1000.0 / response_samples as f64;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

use std::time::Duration;

use crate::ledger::Credits;

/// Pricing used to compute a job's cost once, at submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingConfig {
    pub cost_per_core: Credits,
    pub cost_per_100mb_ram: Credits,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cost_per_core: Credits::from_micros(100_000),
            cost_per_100mb_ram: Credits::from_micros(1_000),
        }
    }
}

impl PricingConfig {
    /// `cores * cost_per_core + (ram_mb / 100) * cost_per_100mb_ram`, with
    /// fractional 100 MB units rounded to the nearest micro-credit.
    pub fn job_cost(&self, cores: u32, ram_mb: u64) -> Credits {
        let core_cost = u128::from(self.cost_per_core.micros()) * u128::from(cores);
        let ram_cost =
            (u128::from(self.cost_per_100mb_ram.micros()) * u128::from(ram_mb) + 50) / 100;
        let total = u64::try_from(core_cost + ram_cost).unwrap_or(u64::MAX);
        Credits::from_micros(total)
    }
}

/// Bounds applied to job submissions before any state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLimits {
    pub min_cores: u32,
    pub max_cores: u32,
    pub min_ram_mb: u64,
    pub max_ram_mb: u64,
    /// Most urgent priority. Lower values are scheduled first.
    pub min_priority: u8,
    pub max_priority: u8,
    pub max_title_len: usize,
    pub max_description_len: usize,
    pub max_command_len: usize,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            min_cores: 1,
            max_cores: 64,
            min_ram_mb: 128,
            max_ram_mb: 131_072,
            min_priority: 1,
            max_priority: 10,
            max_title_len: 200,
            max_description_len: 1000,
            max_command_len: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Balance granted to an account the first time it is referenced.
    pub starting_credits: Credits,
    pub pricing: PricingConfig,
    pub limits: JobLimits,
    /// A worker silent for longer than this is reaped.
    pub worker_timeout: Duration,
    pub reaper_interval: Duration,
    /// Upper bound on non-terminal (pending + running) jobs.
    pub max_queue_size: usize,
    pub max_workers: usize,
    /// Recorded on each job as its deadline. Not enforced by the scheduler.
    pub job_timeout: Duration,
    /// Aging window: within one epoch a more urgent priority always wins.
    pub scheduling_epoch: Duration,
    /// Bound on every durable-store call.
    pub storage_timeout: Duration,
    /// Finished jobs, their transitions and ledger entries older than this
    /// are evicted by the liveness sweep. Account balances are never evicted.
    pub history_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            starting_credits: Credits::from_micros(100_000_000),
            pricing: PricingConfig::default(),
            limits: JobLimits::default(),
            worker_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(10),
            max_queue_size: 1000,
            max_workers: 100,
            job_timeout: Duration::from_secs(3600),
            scheduling_epoch: Duration::from_secs(3600),
            storage_timeout: Duration::from_secs(5),
            history_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_starting_credits(mut self, credits: Credits) -> Self {
        self.starting_credits = credits;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn with_scheduling_epoch(mut self, epoch: Duration) -> Self {
        self.scheduling_epoch = epoch;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_history_retention(mut self, retention: Duration) -> Self {
        self.history_retention = retention;
        self
    }

    /// `worker_timeout` as a chrono duration for timestamp arithmetic.
    pub fn worker_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.worker_timeout).unwrap_or(chrono::Duration::MAX)
    }

    pub fn job_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.job_timeout).unwrap_or(chrono::Duration::MAX)
    }

    pub fn history_retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.history_retention).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_config_default() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.starting_credits.to_string(), "100.00");
        assert_eq!(cfg.worker_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_queue_size, 1000);
        assert_eq!(cfg.max_workers, 100);
        assert_eq!(cfg.job_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.scheduling_epoch, Duration::from_secs(3600));
        assert_eq!(cfg.history_retention, Duration::from_secs(604_800));
    }

    #[test]
    fn job_limits_default() {
        let limits = JobLimits::default();
        assert_eq!((limits.min_cores, limits.max_cores), (1, 64));
        assert_eq!((limits.min_ram_mb, limits.max_ram_mb), (128, 131_072));
        assert_eq!((limits.min_priority, limits.max_priority), (1, 10));
    }

    #[test]
    fn job_cost_combines_cores_and_ram() {
        let pricing = PricingConfig::default();
        // 2 * 0.1 + 40.96 * 0.001
        assert_eq!(pricing.job_cost(2, 4096), Credits::from_micros(240_960));
        assert_eq!(pricing.job_cost(1, 100), Credits::from_micros(101_000));
    }

    #[test]
    fn job_cost_rounds_fractional_ram_units() {
        let pricing = PricingConfig {
            cost_per_core: Credits::ZERO,
            cost_per_100mb_ram: Credits::from_micros(3),
        };
        // 150 MB = 1.5 units * 3 = 4.5 -> 5
        assert_eq!(pricing.job_cost(1, 150), Credits::from_micros(5));
    }

    #[test]
    fn builder_overrides() {
        let cfg = CoordinatorConfig::default()
            .with_worker_timeout(Duration::from_secs(5))
            .with_max_workers(3)
            .with_starting_credits(Credits::from_micros(7));
        assert_eq!(cfg.worker_timeout_chrono(), chrono::Duration::seconds(5));
        assert_eq!(cfg.max_workers, 3);
        assert_eq!(cfg.starting_credits, Credits::from_micros(7));
    }
}

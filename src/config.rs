use std::time::Duration;

use clap::Args;

/// Runtime settings shared by every command. Each can be given as a flag or
/// through the environment.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string.
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, global = true, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    pub db_max_connections: u32,

    /// Relay that delivers email. Email is disabled on every notification
    /// when unset.
    #[arg(long, global = true, env = "EMAIL_WEBHOOK_URL")]
    pub email_webhook_url: Option<url::Url>,

    /// Relay that delivers SMS. SMS is disabled on every notification when
    /// unset.
    #[arg(long, global = true, env = "SMS_WEBHOOK_URL")]
    pub sms_webhook_url: Option<url::Url>,

    #[arg(long, global = true, env = "TRANSPORT_TIMEOUT_SECS", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub transport_timeout_secs: u64,

    /// Students recalculated at once during a sweep.
    #[arg(long, global = true, env = "SWEEP_CONCURRENCY", default_value_t = 8)]
    pub sweep_concurrency: usize,

    /// Sends in flight at once, per channel.
    #[arg(long, global = true, env = "DELIVERY_CONCURRENCY", default_value_t = 4)]
    pub delivery_concurrency: usize,

    #[arg(long, global = true, env = "DAILY_SWEEP_HOURS", default_value_t = 24,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub daily_sweep_hours: u64,

    #[arg(long, global = true, env = "RAPID_SCAN_HOURS", default_value_t = 6,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub rapid_scan_hours: u64,

    /// Academic period stamped on snapshots, e.g. "2025-2026". Derived from
    /// the calculation date when unset.
    #[arg(long, global = true, env = "ACADEMIC_PERIOD")]
    pub academic_period: Option<String>,
}

impl Settings {
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    pub fn daily_interval(&self) -> Duration {
        Duration::from_secs(self.daily_sweep_hours * 3600)
    }

    pub fn rapid_interval(&self) -> Duration {
        Duration::from_secs(self.rapid_scan_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        settings: Settings,
    }

    #[test]
    fn flags_override_defaults() {
        let harness = Harness::try_parse_from([
            "dropout-alerts",
            "--sweep-concurrency",
            "2",
            "--daily-sweep-hours",
            "12",
            "--email-webhook-url",
            "https://relay.example.com/email",
            "--academic-period",
            "2025-2026",
        ])
        .unwrap();

        let settings = harness.settings;
        assert_eq!(settings.sweep_concurrency, 2);
        assert_eq!(settings.daily_interval(), Duration::from_secs(12 * 3600));
        assert_eq!(
            settings.email_webhook_url.map(|url| url.to_string()),
            Some("https://relay.example.com/email".to_string())
        );
        assert_eq!(settings.academic_period.as_deref(), Some("2025-2026"));
    }

    #[test]
    fn zero_hour_intervals_are_rejected() {
        let result = Harness::try_parse_from(["dropout-alerts", "--rapid-scan-hours", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_webhook_urls_are_rejected() {
        let result =
            Harness::try_parse_from(["dropout-alerts", "--sms-webhook-url", "not a url"]);
        assert!(result.is_err());
    }
}

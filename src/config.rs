use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{HOUR_MS, MINUTE_MS, Policy};
use crate::sweeper::SweepIntervals;

/// Server settings, read from `EVFLEET_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name of the operator account (acts as super-admin).
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub sweep: SweepIntervals,
    pub policy: Policy,
}

#[derive(Debug, thiserror::Error)]
#[error("{var}: cannot parse {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "evfleet".into(),
            admin_user: "evfleet".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            sweep: SweepIntervals::default(),
            policy: Policy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults; set but
    /// unparsable keys are an error.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: FromStr>(
            get: &impl Fn(&str) -> Option<String>,
            var: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match get(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError { var, value }),
            }
        }
        let secs = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            Ok(parse::<u64>(&get, var)?.map(Duration::from_secs))
        };

        let mut c = Config::default();
        if let Some(v) = parse(&get, "EVFLEET_PORT")? {
            c.port = v;
        }
        if let Some(v) = get("EVFLEET_BIND") {
            c.bind = v;
        }
        if let Some(v) = get("EVFLEET_DATA_DIR") {
            c.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("EVFLEET_PASSWORD") {
            c.password = v;
        }
        if let Some(v) = get("EVFLEET_ADMIN_USER") {
            c.admin_user = v;
        }
        if let Some(v) = parse(&get, "EVFLEET_MAX_CONNECTIONS")? {
            c.max_connections = v;
        }
        if let Some(v) = parse(&get, "EVFLEET_COMPACT_THRESHOLD")? {
            c.compact_threshold = v;
        }
        c.metrics_port = parse(&get, "EVFLEET_METRICS_PORT")?;
        c.tls_cert = get("EVFLEET_TLS_CERT");
        c.tls_key = get("EVFLEET_TLS_KEY");

        if let Some(d) = secs("EVFLEET_SWEEP_UNCONFIRMED_SECS")? {
            c.sweep.unconfirmed = d;
        }
        if let Some(d) = secs("EVFLEET_SWEEP_PAYMENT_SECS")? {
            c.sweep.payment = d;
        }
        if let Some(d) = secs("EVFLEET_SWEEP_REMINDER_SECS")? {
            c.sweep.reminders = d;
        }
        if let Some(d) = secs("EVFLEET_SWEEP_INBOX_SECS")? {
            c.sweep.inbox = d;
        }

        if let Some(minutes) = parse::<i64>(&get, "EVFLEET_UTC_OFFSET_MINUTES")? {
            c.policy.utc_offset_ms = minutes * MINUTE_MS;
        }
        if let Some(h) = parse::<u8>(&get, "EVFLEET_OPEN_HOUR")? {
            c.policy.open_hour = h;
        }
        if let Some(h) = parse::<u8>(&get, "EVFLEET_CLOSE_HOUR")? {
            c.policy.close_hour = h;
        }
        if c.policy.open_hour >= c.policy.close_hour || c.policy.close_hour > 24 {
            return Err(ConfigError {
                var: "EVFLEET_OPEN_HOUR",
                value: format!("{}..{}", c.policy.open_hour, c.policy.close_hour),
            });
        }
        if c.policy.utc_offset_ms.abs() > 14 * HOUR_MS {
            return Err(ConfigError {
                var: "EVFLEET_UTC_OFFSET_MINUTES",
                value: (c.policy.utc_offset_ms / MINUTE_MS).to_string(),
            });
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let c = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c.port, 5433);
        assert_eq!(c.admin_user, "evfleet");
        assert_eq!(c.sweep, SweepIntervals::default());
        assert_eq!(c.policy, Policy::default());
        assert!(c.metrics_port.is_none());
    }

    #[test]
    fn overrides_apply() {
        let c = Config::from_lookup(lookup(&[
            ("EVFLEET_PORT", "6000"),
            ("EVFLEET_ADMIN_USER", "root"),
            ("EVFLEET_SWEEP_PAYMENT_SECS", "5"),
            ("EVFLEET_UTC_OFFSET_MINUTES", "-300"),
            ("EVFLEET_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.admin_user, "root");
        assert_eq!(c.sweep.payment, Duration::from_secs(5));
        assert_eq!(c.policy.utc_offset_ms, -5 * HOUR_MS);
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("EVFLEET_PORT", "eighty")])).unwrap_err();
        assert_eq!(err.var, "EVFLEET_PORT");
        assert!(Config::from_lookup(lookup(&[("EVFLEET_OPEN_HOUR", "23")])).is_err());
    }
}

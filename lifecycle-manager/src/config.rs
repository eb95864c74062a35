use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use lifecycle_common::aws::ReceiveOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    /// The systemd unit started on launch and stopped on termination.
    #[envconfig(from = "SERVICE")]
    pub service: NonEmptyString,

    #[envconfig(default = "30000")]
    pub spot_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub queue_error_backoff: EnvMsDuration,

    #[envconfig(default = "20")]
    pub queue_wait_time_seconds: i32,

    #[envconfig(default = "10")]
    pub queue_max_messages: i32,

    #[envconfig(default = "120000")]
    pub health_deadline: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.queue_max_messages,
            wait_time_seconds: self.queue_wait_time_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        if ms == 0 {
            // Intervals feed tokio::time::interval, which panics on zero.
            return Err(ParseEnvMsDurationError);
        }

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

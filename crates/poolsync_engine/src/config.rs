//! Configuration for connections.

use crate::certificate::CertificatePolicy;
use poolsync_protocol::ObjectType;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Configuration for one pool connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Address first contacted.
    pub address: String,
    /// Classes mirrored into the store.
    pub tracked_classes: Vec<ObjectType>,
    /// Server-side long-poll timeout.
    pub poll_timeout: Duration,
    /// Extra client-side wait before a long poll is treated as timed out.
    pub poll_grace: Duration,
    /// Reconnect behavior.
    pub retry: RetryConfig,
    /// What the certificate validator may accept.
    pub certificate: CertificatePolicy,
    /// Whether to reconnect automatically after the event stream is lost.
    pub auto_reconnect: bool,
    /// Capacity of the notification channel.
    pub notice_capacity: usize,
}

impl ConnectionConfig {
    /// Creates a configuration for `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tracked_classes: vec![
                ObjectType::Pool,
                ObjectType::Host,
                ObjectType::Vm,
                ObjectType::Sr,
                ObjectType::Network,
                ObjectType::Pif,
                ObjectType::Bond,
                ObjectType::Task,
            ],
            poll_timeout: Duration::from_secs(30),
            poll_grace: Duration::from_secs(5),
            retry: RetryConfig::default(),
            certificate: CertificatePolicy::default(),
            auto_reconnect: true,
            notice_capacity: 1024,
        }
    }

    /// Sets the mirrored classes.
    pub fn with_tracked_classes(mut self, classes: Vec<ObjectType>) -> Self {
        self.tracked_classes = classes;
        self
    }

    /// Sets the long-poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the client-side grace added to long polls.
    pub fn with_poll_grace(mut self, grace: Duration) -> Self {
        self.poll_grace = grace;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the certificate policy.
    pub fn with_certificate_policy(mut self, policy: CertificatePolicy) -> Self {
        self.certificate = policy;
        self
    }

    /// Enables or disables automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% extra.
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Login credentials. The secret is wiped from memory on drop.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// Returns the user name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

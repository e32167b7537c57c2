//! Consumer session and supervisor configuration

use std::time::Duration;

/// Per-registration consumer options
///
/// `queue: None` means the payload type's routing key, see [`Message::routing_key`].
///
/// [`Message::routing_key`]: crate::Message::routing_key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: Option<String>,

    /// Broker acks on delivery; the handler outcome is not reported back
    pub auto_ack: bool,

    /// Requeue a payload whose handler failed
    pub requeue: bool,

    /// Return handler failures from `register` instead of `Ok(false)`
    pub propagate_errors: bool,

    /// Unacked deliveries allowed in flight (0 = registry default, or unlimited)
    pub prefetch: u16,

    pub consumer_tag: Option<String>,
}

impl ConsumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self::default().with_queue(queue)
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_requeue(mut self, requeue: bool) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn with_propagate_errors(mut self, propagate: bool) -> Self {
        self.propagate_errors = propagate;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            queue: None,
            auto_ack: false,
            requeue: true,
            propagate_errors: true,
            prefetch: 0,
            consumer_tag: None,
        }
    }
}

/// Restart policy for a supervised consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Failed sessions tolerated before giving up
    pub max_restart_attempts: u32,
    pub restart_backoff: Duration,
    /// Delay before the first registration, lets the host finish booting
    pub startup_delay: Duration,
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 5,
            restart_backoff: Duration::from_millis(1000),
            startup_delay: Duration::from_millis(5000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_options_defaults() {
        let options = ConsumeOptions::default();
        assert_eq!(options.queue, None);
        assert!(!options.auto_ack);
        assert!(options.requeue);
        assert!(options.propagate_errors);
        assert_eq!(options.prefetch, 0);
    }

    #[test]
    fn test_consume_options_builder() {
        let options = ConsumeOptions::for_queue("client_deleted")
            .with_requeue(false)
            .with_prefetch(10)
            .with_propagate_errors(false);

        assert_eq!(options.queue.as_deref(), Some("client_deleted"));
        assert!(!options.requeue);
        assert_eq!(options.prefetch, 10);
        assert!(!options.propagate_errors);
    }

    #[test]
    fn test_supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.max_restart_attempts, 5);
        assert_eq!(config.restart_backoff, Duration::from_secs(1));
        assert_eq!(config.startup_delay, Duration::from_secs(5));
    }
}

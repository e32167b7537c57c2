//! Consumer supervision
//!
//! Keeps one registration alive: waits out the startup delay, registers, and on every
//! failed session registers again after a backoff. Failed attempts are counted for the
//! life of the supervisor and are never reset. Once the count reaches
//! `max_restart_attempts` the supervisor unregisters everything and reports
//! [`MessagingError::RestartsExhausted`], which is the caller's cue to exit.

use crate::config::{ConsumeOptions, SupervisorConfig};
use crate::consumer::ConsumerRegistry;
use crate::error::MessagingError;
use crate::metrics::MessagingMetrics;
use crate::registry::{Message, MessageHandler};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Supervises the consumer for `M` on one queue
pub struct Supervisor<M, H> {
    registry: Arc<ConsumerRegistry>,
    handler: Arc<H>,
    options: ConsumeOptions,
    config: SupervisorConfig,
    attempts: AtomicU32,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> Supervisor<M, H>
where
    M: Message,
    H: MessageHandler<M> + 'static,
{
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        handler: Arc<H>,
        options: ConsumeOptions,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            handler,
            options,
            config,
            attempts: AtomicU32::new(0),
            _message: PhantomData,
        }
    }

    /// Failed registration attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn queue(&self) -> &str {
        self.options.queue.as_deref().unwrap_or(M::routing_key())
    }

    /// Run until shutdown (`Ok`) or until the restart ceiling is hit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MessagingError> {
        let queue = self.queue().to_string();
        let metrics = MessagingMetrics::new(queue.as_str());

        info!(
            queue = %queue,
            message_type = %M::message_type(),
            startup_delay_ms = self.config.startup_delay.as_millis() as u64,
            max_restart_attempts = self.config.max_restart_attempts,
            "Starting consumer supervisor"
        );

        if !self.pause(self.config.startup_delay, &mut shutdown).await {
            info!(queue = %queue, "Shutdown before the consumer started");
            return Ok(());
        }

        loop {
            if *shutdown.borrow() {
                info!(queue = %queue, "Received shutdown signal, not registering again");
                self.registry.unregister_all();
                return Ok(());
            }

            // The registration exists once this returns, so unregister_all below reaches it
            let mut session = self.registry.spawn_register::<M, Arc<H>>(
                Arc::clone(&self.handler),
                self.options.clone(),
            );

            let result = tokio::select! {
                result = &mut session => result,
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(queue = %queue, "Received shutdown signal, stopping consumer");
                    self.registry.unregister_all();
                    if let Err(e) = session.await {
                        warn!(queue = %queue, error = %e, "Consumer task ended abnormally");
                    }
                    return Ok(());
                }
            };

            match result {
                Ok(Ok(true)) => {
                    info!(queue = %queue, "Consumer unregistered, registering again");
                    continue;
                }
                Ok(Ok(false)) => warn!(queue = %queue, "Consumer session closed"),
                Ok(Err(e)) => error!(queue = %queue, error = %e, "Consumer session failed"),
                Err(e) => error!(queue = %queue, error = %e, "Consumer task panicked"),
            }

            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts >= self.config.max_restart_attempts {
                error!(
                    queue = %queue,
                    attempts,
                    "Consumer restart attempts exhausted, giving up"
                );
                self.registry.unregister_all();
                return Err(MessagingError::RestartsExhausted { attempts });
            }

            metrics.supervisor_restart();
            warn!(
                queue = %queue,
                attempt = attempts,
                max_attempts = self.config.max_restart_attempts,
                backoff_ms = self.config.restart_backoff.as_millis() as u64,
                "Restarting consumer after backoff"
            );
            if !self.pause(self.config.restart_backoff, &mut shutdown).await {
                info!(queue = %queue, "Received shutdown signal during backoff");
                self.registry.unregister_all();
                return Ok(());
            }
        }
    }

    /// Sleep for `duration`; `false` if shutdown arrived first.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = wait_for_shutdown(shutdown) => false,
        }
    }
}

/// Resolves once shutdown is signalled. A dropped sender never resolves.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

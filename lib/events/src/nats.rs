//! NATS ingestion of domain events and signals.
//!
//! The TMS publishes enveloped [`DomainEvent`](crate::event::DomainEvent)s
//! under `tms.events.<kind>` and [`TenantSignal`]s such as approval
//! decisions under `tms.signals.<kind>`. Messages that fail to decode are
//! logged and dropped; events go onto the bus lanes and signals straight to
//! the engine.

use crate::bus::LaneSender;
use crate::config::NatsConfig;
use crate::error::BusError;
use crate::event::{TenantSignal, decode_event, decode_signal};
use async_nats::Subscriber;
use futures::StreamExt;
use haulflow_workflow::{Engine, SignalOutcome};
use rootcause::prelude::Report;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscribes to domain events and signals on NATS.
pub struct NatsEventSource {
    client: async_nats::Client,
    config: NatsConfig,
}

impl NatsEventSource {
    /// Connects to the configured server.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the server cannot be reached.
    pub async fn connect(config: NatsConfig) -> Result<Self, Report<BusError>> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BusError::Connection {
                reason: format!("failed to connect to {}: {e}", config.url),
            })?;
        Ok(Self { client, config })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscriber, Report<BusError>> {
        let subscribed = match &self.config.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        };
        let subscriber = subscribed.map_err(|e| BusError::Connection {
            reason: format!("failed to subscribe to {subject}: {e}"),
        })?;
        info!(%subject, queue_group = ?self.config.queue_group, "subscribed");
        Ok(subscriber)
    }

    /// Forwards events to `lanes` and signals to `engine` until `shutdown`
    /// is cancelled or a subscription ends.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if subscribing fails and `LaneClosed` if the
    /// bus stopped first.
    pub async fn run(
        self,
        lanes: LaneSender,
        engine: Engine,
        shutdown: CancellationToken,
    ) -> Result<(), Report<BusError>> {
        let mut events = self.subscribe(&self.config.subject).await?;
        let mut signals = self.subscribe(&self.config.signal_subject).await?;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                message = events.next() => {
                    let Some(message) = message else {
                        warn!(subject = %self.config.subject, "event subscription closed by server");
                        break;
                    };
                    match decode_event(&message.payload) {
                        Ok(event) => lanes.send(event).await?,
                        Err(e) => {
                            warn!(subject = %message.subject, error = %e, "dropping undecodable event");
                        }
                    }
                }
                message = signals.next() => {
                    let Some(message) = message else {
                        warn!(subject = %self.config.signal_subject, "signal subscription closed by server");
                        break;
                    };
                    match decode_signal(&message.payload) {
                        Ok(signal) => deliver_signal(&engine, signal).await,
                        Err(e) => {
                            warn!(subject = %message.subject, error = %e, "dropping undecodable signal");
                        }
                    }
                }
            }
        }

        for mut subscriber in [events, signals] {
            if let Err(e) = subscriber.unsubscribe().await {
                warn!(error = %e, "failed to unsubscribe");
            }
        }
        Ok(())
    }
}

async fn deliver_signal(engine: &Engine, signal: TenantSignal) {
    let instance = signal.signal.instance;
    let step = signal.signal.step.clone();
    match engine.signal(&signal.tenant, signal.signal).await {
        Ok(SignalOutcome::Delivered) => debug!(%instance, %step, "signal delivered"),
        Ok(SignalOutcome::NotWaiting) => {
            debug!(%instance, %step, "signal ignored, step is not waiting");
        }
        Err(report) => warn!(%instance, %step, error = %report, "signal rejected"),
    }
}

//! Session multiplexer: all channel adapters feed into a single inbound queue,
//! which the gateway drains into the scheduler.

use crate::access;
use crate::commands;
use crate::config::SecurityConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use pv_channels::InboundMessage;
use pv_sched::{InboundEvent, Scheduler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    security: SecurityConfig,
    scheduler: Scheduler,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

impl Gateway {
    pub fn new(
        security: SecurityConfig,
        scheduler: Scheduler,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            security,
            scheduler,
            inbound_rx,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run_loop(shutdown))
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(mut self, shutdown: CancellationToken) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gateway stopping");
                    return;
                }
                msg = self.inbound_rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                tracing::info!("inbound queue closed; gateway exiting");
                return;
            };
            if let Err(e) = self.handle_inbound(inbound) {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let decision =
            access::evaluate_sender(&self.security, &inbound.channel_id, &inbound.sender_id);
        if !decision.is_allowed() {
            tracing::info!(
                channel_id = %inbound.channel_id,
                sender_id = %inbound.sender_id,
                ?decision,
                "inbound message dropped by dm policy"
            );
            return Ok(());
        }

        let key = inbound
            .conversation_key()
            .map_err(|e| anyhow::anyhow!("inbound {} rejected: {e}", inbound.message_id))?;
        let is_control = commands::is_control_command(&inbound.content);
        tracing::debug!(
            conversation_key = %key,
            message_id = %inbound.message_id,
            is_group = inbound.is_group,
            is_control,
            "inbound accepted"
        );
        let received_at = arrival_instant(inbound.received_at, Utc::now());
        self.scheduler.enqueue(
            InboundEvent::new(key, inbound.content, inbound.message_id)
                .control(is_control)
                .received_at(received_at),
        );
        Ok(())
    }
}

/// Maps the transport's wall-clock stamp onto the monotonic clock. A stamp from the
/// future (clock skew) counts as now.
fn arrival_instant(received_at: DateTime<Utc>, now: DateTime<Utc>) -> Instant {
    let lag = (now - received_at).to_std().unwrap_or_default();
    let now = Instant::now();
    now.checked_sub(lag).unwrap_or(now)
}

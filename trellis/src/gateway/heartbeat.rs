//! Cron/heartbeat intake: a poll loop that publishes due jobs as inbound
//! messages on the `cron` channel.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{InboundMessage, MessageBus, PeerKind};
use crate::store::CronStore;

/// Polls the cron table and publishes due jobs until `shutdown` fires.
/// Runs with minimal prompt mode downstream because the dispatcher treats
/// the `cron` channel specially.
pub async fn run_heartbeat(
    cron: Arc<dyn CronStore>,
    bus: Arc<MessageBus>,
    poll: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(poll.max(Duration::from_millis(100)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let jobs = match cron.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "cron list failed");
                continue;
            }
        };
        let now = chrono::Utc::now();
        for job in jobs {
            if !job.is_due(now) {
                continue;
            }
            if let Err(e) = cron.mark_fired(&job.id, now).await {
                tracing::warn!(error = %e, job = %job.id, "cron mark_fired failed");
                continue;
            }
            tracing::debug!(job = %job.id, agent = %job.agent_key, "cron job due");
            bus.publish_inbound(InboundMessage {
                channel: "cron".into(),
                sender_id: format!("cron:{}", job.id),
                chat_id: job.id.clone(),
                peer_kind: PeerKind::Direct,
                content: job.message.clone(),
                user_id: "system".into(),
                agent_key: job.agent_key.clone(),
                metadata: Default::default(),
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CronJob, InMemoryCronStore};

    #[tokio::test]
    async fn due_jobs_are_published_once_per_interval() {
        let cron = InMemoryCronStore::new();
        cron.put(&CronJob {
            id: "j1".into(),
            agent_key: "main".into(),
            interval_secs: 3600,
            message: "heartbeat check".into(),
            enabled: true,
            last_fired_at: None,
        })
        .await
        .unwrap();

        let bus = crate::bus::MessageBus::new(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            cron.clone() as Arc<dyn CronStore>,
            bus.clone(),
            Duration::from_millis(100),
            shutdown.clone(),
        ));

        let m = tokio::time::timeout(Duration::from_secs(2), bus.next_inbound())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.channel, "cron");
        assert_eq!(m.agent_key, "main");
        assert_eq!(m.content, "heartbeat check");

        // The hour-long interval means no second firing right away.
        tokio::select! {
            _ = bus.next_inbound() => panic!("job fired twice"),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn disabled_jobs_never_fire() {
        let cron = InMemoryCronStore::new();
        cron.put(&CronJob {
            id: "j1".into(),
            agent_key: "main".into(),
            interval_secs: 1,
            message: "nope".into(),
            enabled: false,
            last_fired_at: None,
        })
        .await
        .unwrap();

        let bus = crate::bus::MessageBus::new(8);
        let shutdown = CancellationToken::new();
        tokio::spawn(run_heartbeat(
            cron as Arc<dyn CronStore>,
            bus.clone(),
            Duration::from_millis(50),
            shutdown.clone(),
        ));
        tokio::select! {
            _ = bus.next_inbound() => panic!("disabled job fired"),
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
        shutdown.cancel();
    }
}

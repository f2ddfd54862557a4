use std::time::Duration;

use super::ws::{EventSender, PipelineEvent, broadcast_event};

/// Tag-based invalidation of dashboard caches (`dashboard_org_<id>`,
/// `dashboard_team_<id>`). Fire-and-forget: implementations never block
/// and never fail the caller.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, tags: &[String]);
}

/// Pushes `CacheInvalidated` events to connected dashboards.
///
/// With a `resend_after` delay the same tags are announced a second time,
/// so clients that refetched from a lagging upstream cache refetch again.
pub struct BroadcastInvalidator {
    events: EventSender,
    resend_after: Option<Duration>,
}

impl BroadcastInvalidator {
    pub fn new(events: EventSender, resend_after: Option<Duration>) -> Self {
        Self {
            events,
            resend_after: resend_after.filter(|d| !d.is_zero()),
        }
    }
}

impl CacheInvalidator for BroadcastInvalidator {
    fn invalidate(&self, tags: &[String]) {
        if tags.is_empty() {
            return;
        }
        tracing::debug!(?tags, "Invalidating dashboard caches");
        broadcast_event(
            &self.events,
            &PipelineEvent::CacheInvalidated {
                tags: tags.to_vec(),
                delayed: false,
            },
        );

        if let Some(delay) = self.resend_after {
            let events = self.events.clone();
            let tags = tags.to_vec();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broadcast_event(&events, &PipelineEvent::CacheInvalidated { tags, delayed: true });
            });
        }
    }
}

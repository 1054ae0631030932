//! Orchestrator
//!
//! Owns the set of active task processors, keyed by signing identity.
//! `run` starts every processor on its own task and, per processor, a
//! router task that subscribes to the processor's request kind and
//! forwards matching events. Gated processors consult the tier
//! manager before a job is admitted to the pipeline.

use crate::bus::{Event, Filter};
use crate::processor::{self, publish_feedback, TaskProcessor};
use crate::tier::TierManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Ties a processor to the tier that must be subscribed to
pub struct SubscriptionGate {
    pub manager: Arc<TierManager>,
    pub dtag: String,
}

struct Registration {
    processor: Arc<dyn TaskProcessor>,
    gate: Option<SubscriptionGate>,
}

/// Registry and runner for task processors
#[derive(Default)]
pub struct Orchestrator {
    registrations: HashMap<String, Registration>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ungated processor
    pub fn register(&mut self, processor: Arc<dyn TaskProcessor>) {
        self.insert(processor, None);
    }

    /// Register a processor behind a subscription tier
    pub fn register_gated(&mut self, processor: Arc<dyn TaskProcessor>, gate: SubscriptionGate) {
        self.insert(processor, Some(gate));
    }

    fn insert(&mut self, processor: Arc<dyn TaskProcessor>, gate: Option<SubscriptionGate>) {
        let pubkey = processor.descriptor().pubkey().to_string();
        if self.registrations.contains_key(&pubkey) {
            tracing::warn!(%pubkey, "replacing processor registered under the same identity");
        }
        self.registrations.insert(pubkey, Registration { processor, gate });
    }

    /// Number of registered processors
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Start every processor and its router; returns immediately with
    /// the running task handles
    pub async fn run(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let since = chrono::Utc::now().timestamp() as u64;

        for registration in self.registrations.values() {
            let processor = registration.processor.clone();
            let core = processor.core();
            let descriptor = processor.descriptor();

            if core.admin().rebroadcast_announcement {
                if let Err(error) = core.announce().await {
                    tracing::warn!(name = %descriptor.name(), %error, "announcement failed");
                }
            }
            if let (Some(gate), Some(tier_event)) =
                (&registration.gate, &core.admin().delete_tier_event)
            {
                match gate.manager.delete(tier_event).await {
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%tier_event, %error, "tier deletion failed")
                    }
                }
            }

            let subscription = match core
                .bus()
                .subscribe(Filter::new().kinds(vec![descriptor.kind()]).since(since))
                .await
            {
                Ok(rx) => rx,
                Err(error) => {
                    tracing::error!(name = %descriptor.name(), %error, "subscribe failed");
                    continue;
                }
            };

            let (tx, rx) = mpsc::channel(64);
            handles.push(processor::spawn(processor.clone(), rx));
            handles.push(spawn_router(
                processor.clone(),
                registration.gate.as_ref().map(|gate| SubscriptionGate {
                    manager: gate.manager.clone(),
                    dtag: gate.dtag.clone(),
                }),
                subscription,
                tx,
            ));
        }

        handles
    }
}

/// Whether the request names preferred providers and none of them is us
fn addressed_elsewhere(event: &Event, pubkey: &str) -> bool {
    let mut has_provider_tag = false;
    for tag in event.tags_named("p") {
        has_provider_tag = true;
        if tag.get(1).map(|s| s.as_str()) == Some(pubkey) {
            return false;
        }
    }
    has_provider_tag
}

fn spawn_router(
    processor: Arc<dyn TaskProcessor>,
    gate: Option<SubscriptionGate>,
    mut subscription: mpsc::Receiver<Event>,
    inbox: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let descriptor = processor.descriptor().clone();
        while let Some(event) = subscription.recv().await {
            if event.kind != descriptor.kind() {
                continue;
            }
            if addressed_elsewhere(&event, descriptor.pubkey()) {
                tracing::debug!(event_id = %event.id, "request addressed to another provider");
                continue;
            }

            if let Some(gate) = &gate {
                match gate.manager.check_subscription(&event.pubkey, &gate.dtag).await {
                    Ok(status) if status.is_active => {}
                    Ok(_) => {
                        tracing::info!(
                            customer = %event.pubkey,
                            "job rejected, no active subscription"
                        );
                        if let Err(error) = publish_feedback(
                            processor.core().bus().as_ref(),
                            &event,
                            "subscription-required",
                            None,
                        )
                        .await
                        {
                            tracing::warn!(%error, "feedback publish failed");
                        }
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "subscription check failed, job not admitted");
                        continue;
                    }
                }
            }

            if inbox.send(event).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_p_tags(p: &[&str]) -> Event {
        Event {
            id: "e".repeat(64),
            pubkey: "c".repeat(64),
            created_at: 1_700_000_000,
            kind: 5100,
            tags: p
                .iter()
                .map(|pk| vec!["p".to_string(), pk.to_string()])
                .collect(),
            content: String::new(),
        }
    }

    #[test]
    fn test_unaddressed_request_is_for_everyone() {
        let event = event_with_p_tags(&[]);
        assert!(!addressed_elsewhere(&event, "me"));
    }

    #[test]
    fn test_addressed_request_matches_us() {
        let event = event_with_p_tags(&["someone", "me"]);
        assert!(!addressed_elsewhere(&event, "me"));
    }

    #[test]
    fn test_addressed_request_for_other_provider() {
        let event = event_with_p_tags(&["someone"]);
        assert!(addressed_elsewhere(&event, "me"));
    }
}

//! Task processor contract and lifecycle
//!
//! A task processor owns one capability: it validates inbound job
//! request events, translates them into the normalized backend form,
//! dispatches them, and publishes results. Each processor runs on its
//! own task and each accepted job runs on its own task, so jobs never
//! block the acceptance of further jobs.

pub mod image_generation;
pub mod image_upscale;

pub use image_generation::{ImageGeneration, ImageGenerationDefaults};
pub use image_upscale::ImageUpscale;

use crate::bus::{BusError, Event, EventBus, EventTemplate};
use crate::config::{AdminConfig, AnnouncementConfig, ProcessorConfig};
use crate::dispatch::{DispatchError, Dispatcher, JobBackend};
use crate::domain::{
    JobPhase, JobRequest, JobResult, PhaseError, TaskDescriptor, KIND_ANNOUNCEMENT,
    KIND_JOB_FEEDBACK, JOB_RESULT_KIND_OFFSET,
};
use crate::identifier::{IdentifierStore, StoreError};
use crate::translate::TranslateError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Errors from the job pipeline
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("input not supported by this capability")]
    UnsupportedInput,

    #[error("translation failed: {0}")]
    Translation(#[from] TranslateError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("identifier store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

/// Shared state every processor carries, assigned once at init
pub struct ProcessorCore {
    descriptor: TaskDescriptor,
    config: ProcessorConfig,
    admin: AdminConfig,
    announcement: AnnouncementConfig,
    storage_scope: String,
    bus: Arc<dyn EventBus>,
    dispatcher: Dispatcher,
    identifiers: IdentifierStore,
}

impl ProcessorCore {
    /// Bind identity, cost, storage scope and announcement for one
    /// processor instance
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        name: impl Into<String>,
        kind: u16,
        task: impl Into<String>,
        default_cost_msats: u64,
        config: ProcessorConfig,
        admin: AdminConfig,
        announcement: AnnouncementConfig,
        bus: Arc<dyn EventBus>,
        backend: Arc<dyn JobBackend>,
        identifiers: IdentifierStore,
    ) -> Self {
        let descriptor = TaskDescriptor::new(
            name,
            kind,
            task,
            config.fixed_cost_msats.unwrap_or(default_cost_msats),
            bus.identity(),
        );
        let storage_scope = descriptor.storage_scope();
        let dispatcher = Dispatcher::new(backend, config.poll_interval, config.poll_deadline);

        Self {
            descriptor,
            config,
            admin,
            announcement,
            storage_scope,
            bus,
            dispatcher,
            identifiers,
        }
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn admin(&self) -> &AdminConfig {
        &self.admin
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn storage_scope(&self) -> &str {
        &self.storage_scope
    }

    /// Publish the capability announcement and record its event id
    /// under this processor's storage scope
    pub async fn announce(&self) -> Result<String, ProcessorError> {
        let dtag = self
            .identifiers
            .ensure_dtag(
                &self.config.identifier,
                self.descriptor.name(),
                &self.announcement.image,
                self.descriptor.pubkey(),
            )
            .await?;

        let template = EventTemplate::new(
            KIND_ANNOUNCEMENT,
            vec![
                vec!["d".to_string(), dtag],
                vec!["k".to_string(), self.descriptor.kind().to_string()],
            ],
            self.announcement.to_content(self.descriptor.name()).to_string(),
        );
        let event_id = self.bus.publish(template).await?;
        self.identifiers
            .put(&format!("{}/announcement", self.storage_scope), &event_id)
            .await?;

        tracing::info!(
            name = %self.descriptor.name(),
            kind = self.descriptor.kind(),
            %event_id,
            "capability announced"
        );
        Ok(event_id)
    }

    /// Submit the request and block this job's task until the backend
    /// reports a terminal state
    pub async fn dispatch(&self, request: &JobRequest) -> Result<JobResult, DispatchError> {
        let handle = self.dispatcher.dispatch(request).await?;
        handle.wait().await
    }
}

/// The contract every capability implements
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Shared per-instance state
    fn core(&self) -> &ProcessorCore;

    /// Identity of this processor
    fn descriptor(&self) -> &TaskDescriptor {
        self.core().descriptor()
    }

    /// Inspect input/output tags before anything else runs; a false
    /// result drops the job with no side effects
    fn is_input_supported(&self, tags: &[Vec<String>]) -> bool;

    /// Pure translation of a request event into the backend form
    fn create_request_form(&self, event: &Event) -> Result<JobRequest, TranslateError>;

    /// Run the job; errors surface to the caller, never swallowed
    async fn process(&self, request: &JobRequest) -> Result<JobResult, DispatchError> {
        self.core().dispatch(request).await
    }
}

/// Start a processor on its own task, reading jobs from `inbox`
///
/// Returns immediately; each inbound event is handled on a fresh task
/// so long-polling jobs do not block the queue.
pub fn spawn(
    processor: Arc<dyn TaskProcessor>,
    mut inbox: mpsc::Receiver<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = processor.descriptor().name().to_string();
        tracing::info!(%name, "task processor started");
        while let Some(event) = inbox.recv().await {
            let processor = processor.clone();
            tokio::spawn(async move {
                let job_id = processor.descriptor().job_id_for(&event.id);
                match handle_job(processor, &event).await {
                    Ok(()) => {}
                    Err(ProcessorError::UnsupportedInput) => {
                        tracing::debug!(%job_id, "job skipped");
                    }
                    Err(error) => {
                        tracing::warn!(%job_id, %error, "job ended in error");
                    }
                }
            });
        }
        tracing::info!(%name, "task processor stopped");
    })
}

/// Drive one job through the full phase machine
async fn handle_job(
    processor: Arc<dyn TaskProcessor>,
    event: &Event,
) -> Result<(), ProcessorError> {
    let core = processor.core();
    let bus = core.bus();
    let job_id = processor.descriptor().job_id_for(&event.id);
    let mut phase = JobPhase::Received;
    tracing::info!(%job_id, kind = event.kind, customer = %event.pubkey, "job received");

    // validation short-circuits with no side effects
    if !processor.is_input_supported(&event.tags) {
        tracing::info!(%job_id, "input not supported, skipping");
        return Err(ProcessorError::UnsupportedInput);
    }
    phase = phase.advance_to(JobPhase::Validated)?;
    publish_feedback(bus.as_ref(), event, "processing", None).await?;

    let request = match processor.create_request_form(event) {
        Ok(request) => request,
        Err(error) => {
            publish_feedback(bus.as_ref(), event, "error", Some(&error.to_string())).await?;
            phase.advance_to(JobPhase::Failed)?;
            return Err(error.into());
        }
    };
    phase = phase.advance_to(JobPhase::Translated)?;

    match processor.process(&request).await {
        Ok(result) if result.is_success() => {
            phase = phase
                .advance_to(JobPhase::Dispatched)?
                .advance_to(JobPhase::Polling)?
                .advance_to(JobPhase::Completed)?;
            debug_assert!(phase.is_terminal());

            let template = result_template(event, &result, processor.descriptor());
            let result_id = bus.publish(template).await?;
            tracing::info!(%job_id, %result_id, "job result published");
            Ok(())
        }
        Ok(result) => {
            let detail = result.error.unwrap_or_else(|| "backend failure".to_string());
            tracing::warn!(%job_id, error = %detail, "backend reported job failure");
            publish_feedback(bus.as_ref(), event, "error", Some(&detail)).await?;
            phase.advance_to(JobPhase::Failed)?;
            Ok(())
        }
        Err(error) => {
            publish_feedback(bus.as_ref(), event, "error", Some(&error.to_string())).await?;
            phase.advance_to(JobPhase::Failed)?;
            Err(error.into())
        }
    }
}

/// Job feedback event (kind 7000) referencing the request
pub async fn publish_feedback(
    bus: &dyn EventBus,
    request_event: &Event,
    status: &str,
    extra: Option<&str>,
) -> Result<String, BusError> {
    let mut status_tag = vec!["status".to_string(), status.to_string()];
    if let Some(extra) = extra {
        status_tag.push(extra.to_string());
    }
    let template = EventTemplate::new(
        KIND_JOB_FEEDBACK,
        vec![
            status_tag,
            vec!["e".to_string(), request_event.id.clone()],
            vec!["p".to_string(), request_event.pubkey.clone()],
        ],
        String::new(),
    );
    bus.publish(template).await
}

/// Job result event: request kind + 1000, carrying the original
/// request, its inputs, the customer and the fixed cost
fn result_template(event: &Event, result: &JobResult, descriptor: &TaskDescriptor) -> EventTemplate {
    let mut tags = vec![
        vec![
            "request".to_string(),
            serde_json::to_string(event).unwrap_or_default(),
        ],
        vec!["e".to_string(), event.id.clone()],
    ];
    for tag in event.tags_named("i") {
        tags.push(tag.clone());
    }
    tags.push(vec!["p".to_string(), event.pubkey.clone()]);
    tags.push(vec![
        "amount".to_string(),
        descriptor.fixed_cost_msats().to_string(),
    ]);

    EventTemplate::new(
        event.kind + JOB_RESULT_KIND_OFFSET,
        tags,
        result.content.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::bus::Filter;

    fn request_event() -> Event {
        Event {
            id: "e".repeat(64),
            pubkey: "c".repeat(64),
            created_at: 1_700_000_000,
            kind: 5100,
            tags: vec![vec![
                "i".to_string(),
                "a cat".to_string(),
                "text".to_string(),
            ]],
            content: String::new(),
        }
    }

    #[tokio::test]
    async fn test_feedback_event_shape() {
        let bus = MemoryBus::new("a".repeat(64));
        let event = request_event();

        publish_feedback(&bus, &event, "error", Some("bad strength"))
            .await
            .unwrap();

        let feedback = bus
            .query(Filter::new().kinds(vec![KIND_JOB_FEEDBACK]))
            .await
            .unwrap();
        assert_eq!(feedback.len(), 1);
        let tags = &feedback[0].tags;
        assert!(tags.contains(&vec![
            "status".to_string(),
            "error".to_string(),
            "bad strength".to_string()
        ]));
        assert!(tags.contains(&vec!["e".to_string(), event.id.clone()]));
        assert!(tags.contains(&vec!["p".to_string(), event.pubkey.clone()]));
    }

    #[test]
    fn test_result_template_shape() {
        let event = request_event();
        let descriptor = TaskDescriptor::new("Painter", 5100, "text-to-image", 50_000, "a");
        let template = result_template(&event, &JobResult::success("https://out.png"), &descriptor);

        assert_eq!(template.kind, 6100);
        assert_eq!(template.content, "https://out.png");
        assert!(template.tags.contains(&vec!["e".to_string(), event.id.clone()]));
        assert!(template
            .tags
            .contains(&vec!["amount".to_string(), "50000".to_string()]));
        // original inputs travel with the result
        assert!(template.tags.contains(&vec![
            "i".to_string(),
            "a cat".to_string(),
            "text".to_string()
        ]));
    }
}

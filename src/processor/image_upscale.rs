//! Image upscaling task processor
//!
//! Accepted inputs: a link to an image (url). Output: a URL to the
//! upscaled image. Params: `upscale` (factor 2-4, default 4).

use super::{ProcessorCore, TaskProcessor};
use crate::bus::{Event, EventBus};
use crate::config::{AdminConfig, AnnouncementConfig, ProcessorConfig};
use crate::dispatch::{HttpBackend, JobBackend};
use crate::domain::{InputItem, JobRequest, KIND_GENERATE_IMAGE};
use crate::identifier::IdentifierStore;
use crate::translate::{RequestTags, TranslateError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

const RECOGNIZED_PARAMS: &[&str] = &["upscale"];

const TASK: &str = "image-to-image";
const DEFAULT_COST_MSATS: u64 = 20_000;
const ROUTE: &str = "modules/image-upscale-realesrgan";
const DEFAULT_FACTOR: f64 = 4.0;

/// Upscales an image from a URL on an external backend
pub struct ImageUpscale {
    core: ProcessorCore,
}

impl ImageUpscale {
    /// Processor talking to the HTTP backend from the configuration
    pub fn new(
        name: impl Into<String>,
        config: ProcessorConfig,
        admin: AdminConfig,
        announcement: AnnouncementConfig,
        bus: Arc<dyn EventBus>,
        identifiers: IdentifierStore,
    ) -> Self {
        let backend = Arc::new(HttpBackend::new(config.backend_url.clone()));
        Self::with_backend(name, config, admin, announcement, bus, backend, identifiers)
    }

    /// Processor with an injected backend
    pub fn with_backend(
        name: impl Into<String>,
        config: ProcessorConfig,
        admin: AdminConfig,
        announcement: AnnouncementConfig,
        bus: Arc<dyn EventBus>,
        backend: Arc<dyn JobBackend>,
        identifiers: IdentifierStore,
    ) -> Self {
        let core = ProcessorCore::init(
            name,
            KIND_GENERATE_IMAGE,
            TASK,
            DEFAULT_COST_MSATS,
            config,
            admin,
            announcement,
            bus,
            backend,
            identifiers,
        );
        Self { core }
    }
}

impl TaskProcessor for ImageUpscale {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn is_input_supported(&self, tags: &[Vec<String>]) -> bool {
        // needs a url input; anything else is for another capability
        RequestTags::parse(tags).input_of_kind("url").is_some()
    }

    fn create_request_form(&self, event: &Event) -> Result<JobRequest, TranslateError> {
        let tags = RequestTags::parse(&event.tags);
        let url = tags
            .input_of_kind("url")
            .ok_or(TranslateError::MissingInput("url"))?
            .to_string();
        let factor = tags.number("upscale")?.unwrap_or(DEFAULT_FACTOR);

        let mut options = BTreeMap::new();
        options.insert("outscale".to_string(), Value::from(factor));
        for (name, value) in tags.unrecognized(RECOGNIZED_PARAMS) {
            options.insert(name.to_string(), Value::from(value));
        }

        Ok(JobRequest {
            job_id: self.descriptor().job_id_for(&event.id),
            route: ROUTE.to_string(),
            data: vec![
                InputItem::url("input_image", url),
                InputItem::output_image("output_image"),
            ],
            options,
        })
    }
}

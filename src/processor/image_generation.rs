//! Text-to-image task processor
//!
//! Accepted inputs: a text prompt. Output: a URL to an image.
//! Params: `negative_prompt`, `lora`, `lora_weight`, `strength`,
//! `guidance_scale`, `ratio`, `size`, `model`.

use super::{ProcessorCore, TaskProcessor};
use crate::bus::{Event, EventBus};
use crate::config::{AdminConfig, AnnouncementConfig, ProcessorConfig};
use crate::dispatch::{HttpBackend, JobBackend};
use crate::domain::{InputItem, JobRequest, KIND_GENERATE_IMAGE};
use crate::identifier::IdentifierStore;
use crate::translate::{Dimensions, RequestTags, TranslateError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output representations this capability can produce
const ACCEPTED_OUTPUTS: &[&str] = &[
    "image/png",
    "image/jpg",
    "image/jpeg",
    "image/png;format=url",
    "image/jpg;format=url",
];

/// Parameter names consumed by this capability; everything else passes
/// through to the backend untouched
const RECOGNIZED_PARAMS: &[&str] = &[
    "negative_prompt",
    "lora",
    "lora_weight",
    "strength",
    "guidance_scale",
    "ratio",
    "size",
    "model",
];

const TASK: &str = "text-to-image";
const DEFAULT_COST_MSATS: u64 = 50_000;
const ROUTE: &str = "modules/stable-diffusion-xl";

/// Instance defaults applied when the request leaves a field unset
#[derive(Debug, Clone)]
pub struct ImageGenerationDefaults {
    pub model: String,
    pub lora: String,
}

impl Default for ImageGenerationDefaults {
    fn default() -> Self {
        Self {
            model: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            lora: String::new(),
        }
    }
}

/// Options recognized by the image generation backend, validated at
/// translation time
#[derive(Debug, Clone, PartialEq)]
struct ImageGenerationOptions {
    model: String,
    dimensions: Dimensions,
    strength: Option<f64>,
    guidance_scale: Option<f64>,
    lora: String,
    lora_weight: String,
    negative_prompt: String,
}

impl ImageGenerationOptions {
    fn from_tags(
        tags: &RequestTags,
        defaults: &ImageGenerationDefaults,
    ) -> Result<Self, TranslateError> {
        Ok(Self {
            model: tags
                .param("model")
                .unwrap_or(defaults.model.as_str())
                .to_string(),
            dimensions: Dimensions::from_tags(tags)?,
            strength: tags.number("strength")?,
            guidance_scale: tags.number("guidance_scale")?,
            lora: tags
                .param("lora")
                .unwrap_or(defaults.lora.as_str())
                .to_string(),
            lora_weight: tags.param("lora_weight").unwrap_or_default().to_string(),
            negative_prompt: tags.param("negative_prompt").unwrap_or_default().to_string(),
        })
    }

    fn into_options(self) -> BTreeMap<String, Value> {
        let mut options = BTreeMap::new();
        options.insert("model".to_string(), Value::from(self.model));
        options.insert("ratio".to_string(), Value::from(self.dimensions.ratio_label()));
        options.insert("width".to_string(), Value::from(self.dimensions.width));
        options.insert("height".to_string(), Value::from(self.dimensions.height));
        options.insert("strength".to_string(), num_or_empty(self.strength));
        options.insert(
            "guidance_scale".to_string(),
            num_or_empty(self.guidance_scale),
        );
        options.insert("lora".to_string(), Value::from(self.lora));
        options.insert("lora_weight".to_string(), Value::from(self.lora_weight));
        options
    }
}

fn num_or_empty(value: Option<f64>) -> Value {
    match value {
        Some(n) => Value::from(n),
        None => Value::from(""),
    }
}

/// Draws images from a text prompt on an external diffusion backend
pub struct ImageGeneration {
    core: ProcessorCore,
    defaults: ImageGenerationDefaults,
}

impl ImageGeneration {
    /// Processor talking to the HTTP backend from the configuration
    pub fn new(
        name: impl Into<String>,
        config: ProcessorConfig,
        admin: AdminConfig,
        announcement: AnnouncementConfig,
        bus: Arc<dyn EventBus>,
        identifiers: IdentifierStore,
        defaults: ImageGenerationDefaults,
    ) -> Self {
        let backend = Arc::new(HttpBackend::new(config.backend_url.clone()));
        Self::with_backend(name, config, admin, announcement, bus, backend, identifiers, defaults)
    }

    /// Processor with an injected backend
    #[allow(clippy::too_many_arguments)]
    pub fn with_backend(
        name: impl Into<String>,
        config: ProcessorConfig,
        admin: AdminConfig,
        announcement: AnnouncementConfig,
        bus: Arc<dyn EventBus>,
        backend: Arc<dyn JobBackend>,
        identifiers: IdentifierStore,
        defaults: ImageGenerationDefaults,
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
        Self { core, defaults }
    }
}

impl TaskProcessor for ImageGeneration {
    fn core(&self) -> &ProcessorCore {
        &self.core
    }

    fn is_input_supported(&self, tags: &[Vec<String>]) -> bool {
        let tags = RequestTags::parse(tags);
        if tags.input_of_kind("text").is_none() || !tags.all_inputs_are("text") {
            return false;
        }
        if let Some(mime) = &tags.output_mime {
            if !ACCEPTED_OUTPUTS.contains(&mime.as_str()) {
                tracing::debug!(%mime, "output format not supported, skipping");
                return false;
            }
        }
        true
    }

    fn create_request_form(&self, event: &Event) -> Result<JobRequest, TranslateError> {
        let tags = RequestTags::parse(&event.tags);
        let prompt = tags
            .input_of_kind("text")
            .ok_or(TranslateError::MissingInput("text"))?
            .to_string();

        let parsed = ImageGenerationOptions::from_tags(&tags, &self.defaults)?;
        let negative_prompt = parsed.negative_prompt.clone();

        let mut options = parsed.into_options();
        for (name, value) in tags.unrecognized(RECOGNIZED_PARAMS) {
            options.insert(name.to_string(), Value::from(value));
        }

        Ok(JobRequest {
            job_id: self.descriptor().job_id_for(&event.id),
            route: ROUTE.to_string(),
            data: vec![
                InputItem::text("input_prompt", prompt),
                InputItem::text("negative_prompt", negative_prompt),
                InputItem::output_image("output_image"),
            ],
            options,
        })
    }
}

//! Processor configuration
//!
//! Plain structs filled by the embedding application; no environment
//! or file loading happens here.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cadence of backend status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default upper bound on the whole poll loop
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(120);

/// Per-processor runtime configuration, fixed at init
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Stable slug used to key persisted identifiers, e.g. "unstable_diffusion"
    pub identifier: String,
    /// Overrides the capability's default price when set
    pub fixed_cost_msats: Option<u64>,
    /// Base URL of the compute backend
    pub backend_url: String,
    /// Cadence of backend status polls
    pub poll_interval: Duration,
    /// A poll loop exceeding this deadline fails the job
    pub poll_deadline: Duration,
}

impl ProcessorConfig {
    pub fn new(identifier: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fixed_cost_msats: None,
            backend_url: backend_url.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_deadline: DEFAULT_POLL_DEADLINE,
        }
    }

    pub fn with_fixed_cost(mut self, msats: u64) -> Self {
        self.fixed_cost_msats = Some(msats);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_poll_deadline(mut self, deadline: Duration) -> Self {
        self.poll_deadline = deadline;
        self
    }
}

/// Administrative switches applied at startup
#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    /// Publish the capability announcement again on startup
    pub rebroadcast_announcement: bool,
    /// Delete this tier event on startup (ownership is enforced)
    pub delete_tier_event: Option<String>,
}

/// One declared request parameter in the capability announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(skip)]
    pub name: String,
    pub required: bool,
    pub values: Vec<String>,
}

impl ParamSpec {
    pub fn optional(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            required: false,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Content of the capability announcement record
#[derive(Debug, Clone, Default)]
pub struct AnnouncementConfig {
    /// Image URL shown for the capability
    pub image: String,
    /// Human-readable description
    pub about: String,
    /// Parameters the capability understands
    pub params: Vec<ParamSpec>,
}

impl AnnouncementConfig {
    pub fn new(image: impl Into<String>, about: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            about: about.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// JSON content of the announcement event
    pub fn to_content(&self, name: &str) -> serde_json::Value {
        let params: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({ "required": p.required, "values": p.values }),
                )
            })
            .collect();
        serde_json::json!({
            "name": name,
            "image": self.image,
            "about": self.about,
            "nip90Params": params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProcessorConfig::new("sdxl", "http://localhost:8000");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.poll_deadline, DEFAULT_POLL_DEADLINE);
        assert_eq!(config.fixed_cost_msats, None);
    }

    #[test]
    fn test_announcement_content() {
        let announcement = AnnouncementConfig::new("https://img", "I draw images")
            .with_param(ParamSpec::optional("ratio", &["1:1", "4:3", "16:9"]));

        let content = announcement.to_content("Unstable Diffusion");
        assert_eq!(content["name"], "Unstable Diffusion");
        assert_eq!(content["nip90Params"]["ratio"]["required"], false);
        assert_eq!(content["nip90Params"]["ratio"]["values"][1], "4:3");
    }
}

//! Task processor identity

use serde::{Deserialize, Serialize};

/// Immutable identity of one task processor instance
///
/// Constructed once at startup and owned by its processor; never
/// shared as mutable state between instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    name: String,
    kind: u16,
    task: String,
    fixed_cost_msats: u64,
    pubkey: String,
}

impl TaskDescriptor {
    pub fn new(
        name: impl Into<String>,
        kind: u16,
        task: impl Into<String>,
        fixed_cost_msats: u64,
        pubkey: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            task: task.into(),
            fixed_cost_msats,
            pubkey: pubkey.into(),
        }
    }

    /// Display name, e.g. "Unstable Diffusion"
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Job request kind this processor serves
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// Task label, e.g. "text-to-image"
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Fixed price per job in millisats
    pub fn fixed_cost_msats(&self) -> u64 {
        self.fixed_cost_msats
    }

    /// Hex public key this processor signs with
    pub fn pubkey(&self) -> &str {
        &self.pubkey
    }

    /// Job id for a request event: `<eventId>_<name without spaces>`
    pub fn job_id_for(&self, event_id: &str) -> String {
        format!("{}_{}", event_id, self.name.replace(' ', ""))
    }

    /// Storage scope bound to this processor
    pub fn storage_scope(&self) -> String {
        format!("db/{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_strips_spaces() {
        let descriptor =
            TaskDescriptor::new("Unstable Diffusion", 5100, "text-to-image", 50_000, "ab");
        assert_eq!(descriptor.job_id_for("ev1"), "ev1_UnstableDiffusion");
    }

    #[test]
    fn test_storage_scope() {
        let descriptor = TaskDescriptor::new("Image Upscaler", 5100, "image-to-image", 20_000, "ab");
        assert_eq!(descriptor.storage_scope(), "db/Image Upscaler");
    }
}

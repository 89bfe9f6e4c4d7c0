// Error taxonomy for the renderer
//
// Functions return anyhow::Result like the rest of the crate. The variants
// below are attached at the failure site so the instance owner can classify
// a failure with `err.downcast_ref::<RenderError>()`.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    /// A GPU object creation or memory allocation failed.
    #[error("failed to create {what}: {reason}")]
    ResourceCreation { what: &'static str, reason: String },

    /// No candidate format satisfies the required features.
    #[error("no supported {purpose} format among {candidates:?}")]
    UnsupportedFormat {
        purpose: &'static str,
        candidates: Vec<vk::Format>,
    },

    /// No suitable physical device or queue family.
    #[error("missing GPU capability: {0}")]
    CapabilityMissing(String),

    /// A staging/copy submission or its wait failed.
    #[error("transfer failed while {stage}: {result}")]
    Transfer {
        stage: &'static str,
        result: vk::Result,
    },

    /// Construction input was rejected before any GPU resource was created.
    #[error("invalid draw set: {0}")]
    InvalidDrawSet(String),
}

impl RenderError {
    pub fn creation(what: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::ResourceCreation {
            what,
            reason: reason.to_string(),
        }
    }
}

/// Maps raw `vk::Result` failures onto the taxonomy.
pub(crate) trait VkResultExt<T> {
    fn creating(self, what: &'static str) -> Result<T, RenderError>;
    fn transferring(self, stage: &'static str) -> Result<T, RenderError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn creating(self, what: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| RenderError::creation(what, result))
    }

    fn transferring(self, stage: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| RenderError::Transfer { stage, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_failures_keep_their_category_through_anyhow() {
        let failed: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err: anyhow::Error = failed.creating("vertex buffer").unwrap_err().into();

        match err.downcast_ref::<RenderError>() {
            Some(RenderError::ResourceCreation { what, .. }) => assert_eq!(*what, "vertex buffer"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn transfer_failures_name_the_stage() {
        let failed: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = failed.transferring("waiting for upload").unwrap_err();
        assert!(err.to_string().contains("waiting for upload"));
    }
}

// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;
use vantage_render::MeshError;

pub type Result<T, E = VkError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum VkError {
    #[error("no suitable GPU among {candidates} adapter(s)")]
    NoSuitableAdapter { candidates: usize },

    #[error("validation layer {0} requested but not available")]
    ValidationLayerUnavailable(&'static str),

    #[error("{op}: out of memory ({result:?})")]
    OutOfMemory { op: &'static str, result: vk::Result },

    #[error("{op}: device lost")]
    DeviceLost { op: &'static str },

    #[error("{op} failed: {result:?}")]
    Call { op: &'static str, result: vk::Result },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("invalid shader binary: {0}")]
    Shader(String),

    #[error("invalid mesh: {0}")]
    Mesh(#[from] MeshError),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("window handle unavailable: {0}")]
    Window(String),

    #[error("render failed ({original}) and recovery failed ({recovery})")]
    RecoveryFailed {
        original: Box<VkError>,
        recovery: Box<VkError>,
    },
}

pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

impl VkError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Wrap a raw result code with the name of the call that produced it.
    pub fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost { op },
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory { op, result }
            }
            vk::Result::ERROR_LAYER_NOT_PRESENT => Self::ValidationLayerUnavailable(VALIDATION_LAYER),
            _ => Self::Call { op, result },
        }
    }

    /// The raw code behind a failed call, if there was one.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::OutOfMemory { result, .. } | Self::Call { result, .. } => Some(*result),
            Self::DeviceLost { .. } => Some(vk::Result::ERROR_DEVICE_LOST),
            _ => None,
        }
    }
}

pub trait VkResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|r| VkError::from_vk(op, r))
    }
}

// SPDX-License-Identifier: CEPL-1.0
//! Adapter selection and logical device bootstrap.
use std::ffi::CStr;

use ash::vk;
use vantage_core::{DiagnosticsExt, SharedDiagnostics};

use crate::error::{Result, VkError, VkResultExt};
use crate::gpu::{AdapterFeatures, AdapterInfo, DeviceQueues, Gpu, QueueFamilyInfo};

const COMPONENT: &str = "device";

pub const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

const GIB: u64 = 1024 * 1024 * 1024;

/// Queue family indices on one adapter. Graphics and present are mandatory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilySet {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilySet {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Resources touched by both graphics and present need CONCURRENT
    /// sharing when the two families differ.
    pub fn sharing_mode(&self) -> vk::SharingMode {
        match (self.graphics, self.present) {
            (Some(g), Some(p)) if g != p => vk::SharingMode::CONCURRENT,
            _ => vk::SharingMode::EXCLUSIVE,
        }
    }

    /// Distinct families, in graphics/present/compute/transfer order.
    pub fn unique(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(4);
        for family in [self.graphics, self.present, self.compute, self.transfer]
            .into_iter()
            .flatten()
        {
            if !out.contains(&family) {
                out.push(family);
            }
        }
        out
    }
}

pub fn find_queue_families(families: &[QueueFamilyInfo]) -> QueueFamilySet {
    let index = |i: usize| i as u32;

    let graphics = families
        .iter()
        .position(|f| f.queue_count > 0 && f.flags.contains(vk::QueueFlags::GRAPHICS))
        .map(index);
    // Same family for both when possible
    let present = match graphics {
        Some(g) if families[g as usize].present => Some(g),
        _ => families.iter().position(|f| f.queue_count > 0 && f.present).map(index),
    };
    let compute = families
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.flags.contains(vk::QueueFlags::COMPUTE)
                && !f.flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .or_else(|| {
            families
                .iter()
                .position(|f| f.queue_count > 0 && f.flags.contains(vk::QueueFlags::COMPUTE))
        })
        .map(index);
    let transfer = families
        .iter()
        .position(|f| {
            f.queue_count > 0
                && f.flags.contains(vk::QueueFlags::TRANSFER)
                && !f.flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(index);

    QueueFamilySet {
        graphics,
        present,
        compute,
        transfer,
    }
}

fn has_required_extensions(adapter: &AdapterInfo) -> bool {
    REQUIRED_DEVICE_EXTENSIONS.iter().all(|req| {
        let req = req.to_string_lossy();
        adapter.extensions.iter().any(|e| *e == req)
    })
}

/// Zero means unusable, including a suitable adapter that earns no
/// points. Higher is better.
pub fn score_adapter(adapter: &AdapterInfo) -> u64 {
    if !find_queue_families(&adapter.queue_families).is_complete()
        || !has_required_extensions(adapter)
        || adapter.surface_format_count == 0
        || adapter.present_mode_count == 0
    {
        return 0;
    }

    let mut score = match adapter.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 500,
        _ => 0,
    };
    score += u64::from(adapter.max_image_dimension_2d) / 1000;
    if adapter.features.contains(AdapterFeatures::GEOMETRY_SHADER) {
        score += 100;
    }
    if adapter.features.contains(AdapterFeatures::TESSELLATION_SHADER) {
        score += 50;
    }
    if adapter.features.contains(AdapterFeatures::SAMPLER_ANISOTROPY) {
        score += 25;
    }
    score += (adapter.device_local_bytes / GIB) * 10;
    score
}

/// Highest score wins; ties keep the earliest enumerated adapter.
pub fn select_adapter(adapters: &[AdapterInfo]) -> Result<(usize, u64)> {
    let mut best: Option<(usize, u64)> = None;
    for (i, adapter) in adapters.iter().enumerate() {
        let score = score_adapter(adapter);
        // strictly greater: a later adapter never displaces an equal one
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((i, score));
        }
    }
    best.ok_or(VkError::NoSuitableAdapter {
        candidates: adapters.len(),
    })
}

/// Selected adapter, its queue layout and the retrieved queues. The logical
/// device itself lives in the backend.
#[derive(Clone, Debug)]
pub struct DeviceContext {
    pub adapter: AdapterInfo,
    pub families: QueueFamilySet,
    pub queues: DeviceQueues,
    diag: SharedDiagnostics,
}

impl DeviceContext {
    pub fn create(
        gpu: &mut dyn Gpu,
        surface: vk::SurfaceKHR,
        diag: SharedDiagnostics,
    ) -> Result<Self> {
        // STRICT ORDER:
        // 1) Enumerate adapters AGAINST THIS SURFACE (present support, formats)
        // 2) Score + pick; nothing usable is fatal and not retried
        // 3) Create the logical device with one queue per distinct family
        // 4) Fetch queues; transfer falls back to graphics
        let adapters = gpu
            .enumerate_adapters(surface)
            .op("vkEnumeratePhysicalDevices")?;
        for a in &adapters {
            diag.info(
                COMPONENT,
                format!(
                    "adapter '{}' type={:?} score={}",
                    a.name,
                    a.device_type,
                    score_adapter(a)
                ),
            );
        }

        let (chosen, score) = select_adapter(&adapters)?;
        let adapter = adapters[chosen].clone();
        let families = find_queue_families(&adapter.queue_families);
        let (Some(graphics), Some(present)) = (families.graphics, families.present) else {
            return Err(VkError::precondition("selected adapter lost its graphics/present family"));
        };

        gpu.create_device(adapter.handle, &families.unique(), REQUIRED_DEVICE_EXTENSIONS)
            .op("vkCreateDevice")?;

        let graphics_queue = gpu.device_queue(graphics);
        let queues = DeviceQueues {
            graphics: graphics_queue,
            present: gpu.device_queue(present),
            compute: families.compute.map(|f| gpu.device_queue(f)),
            transfer: Some(
                families
                    .transfer
                    .map_or(graphics_queue, |f| gpu.device_queue(f)),
            ),
        };

        diag.info(
            COMPONENT,
            format!(
                "selected '{}' (score {score}), families g={graphics} p={present} c={:?} t={:?}",
                adapter.name, families.compute, families.transfer
            ),
        );
        diag.created(COMPONENT, "logical device");

        Ok(Self {
            adapter,
            families,
            queues,
            diag,
        })
    }

    pub fn graphics_family(&self) -> u32 {
        self.families.graphics.unwrap_or_default()
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.queues.transfer.unwrap_or(self.queues.graphics)
    }

    pub fn destroy(self, gpu: &mut dyn Gpu) {
        gpu.destroy_device();
        self.diag.destroyed(COMPONENT, "logical device");
    }
}

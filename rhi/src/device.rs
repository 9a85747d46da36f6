//! Instance/device/queue bootstrap (spec §3/§6).
//!
//! Grounded on the teacher's `VulkanDevice::new`/`new_with_surface`
//! (`vulkan/mod.rs`): one graphics+compute queue family, an optional
//! dedicated transfer-only queue when the device exposes one, validation
//! layers toggled by the `validation` feature or `LUME_VALIDATION`. Departs
//! from the teacher in one way required by spec §1's explicit scope cut:
//! "the window/surface platform layer ... is out of scope — the core only
//! consumes a `Surface` handle." The teacher creates its own Win32 surface
//! inline; this module instead takes an already-created `vk::SurfaceKHR` (and
//! its `surface_khr::Instance` loader) from the caller, who owns whatever
//! platform windowing crate produced it, and only adds the instance/device
//! extensions presentation needs.

use std::ffi::CString;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use ash::khr::{surface as surface_khr, swapchain as swapchain_khr};
use ash::vk;

use crate::error::{Error, Result};
use crate::resource::ResourceId;

#[cfg(feature = "validation")]
fn validation_layer_names(entry: &ash::Entry) -> Vec<CString> {
    let disable = std::env::var("LUME_VALIDATION").is_ok_and(|v| v == "0" || v.eq_ignore_ascii_case("false"));
    if disable {
        return Vec::new();
    }
    let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(l) => l,
        Err(_) => return Vec::new(),
    };
    const KHRONOS: &str = "VK_LAYER_KHRONOS_validation";
    for prop in &layers {
        let name = unsafe { std::ffi::CStr::from_ptr(prop.layer_name.as_ptr()).to_string_lossy() };
        if name == KHRONOS {
            return vec![CString::new(KHRONOS).unwrap()];
        }
    }
    Vec::new()
}

#[cfg(not(feature = "validation"))]
fn validation_layer_names(_entry: &ash::Entry) -> Vec<CString> {
    if std::env::var("LUME_VALIDATION").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
        log::warn!("LUME_VALIDATION=1 set but gsg-vk built without 'validation' feature");
    }
    Vec::new()
}

/// Owns the instance/device/queues for the process's lifetime. Everything
/// else (`memory::MemoryAllocator`, `framebuffer::FramebufferCache`,
/// `descriptor_cache::DescriptorSetCache`, `pipeline_cache::PipelineCache`)
/// is constructed from `device.clone()` by `gsg.rs`, not owned here.
pub struct GsgDevice {
    #[allow(dead_code)]
    entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Arc<ash::Device>,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub transfer_queue: Option<vk::Queue>,
    pub transfer_command_pool: Option<vk::CommandPool>,
    pub command_pool: vk::CommandPool,
    next_id: Arc<AtomicU64>,
}

fn pick_transfer_family(props: &[vk::QueueFamilyProperties], graphics_family: u32) -> Option<u32> {
    props
        .iter()
        .position(|p| {
            p.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !p.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && !p.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|i| i as u32)
        .filter(|&tf| tf != graphics_family)
}

impl GsgDevice {
    /// Headless bootstrap: no presentation support, used for render-to-texture
    /// workloads and the test/demo harness.
    pub fn new() -> Result<Arc<Self>> {
        Self::new_with_extensions(&[], |_entry, _instance, _physical_devices| Ok(None))
    }

    /// Bootstraps with presentation support against a caller-owned surface.
    /// `surface_for` is invoked once the instance exists and picks the queue
    /// family that supports both graphics and presenting to `surface`,
    /// returning it alongside the `VK_KHR_swapchain` device extension
    /// requirement.
    pub fn new_with_surface(
        instance_extensions: &[&'static std::ffi::CStr],
        surface_loader_factory: impl FnOnce(&ash::Entry, &ash::Instance) -> surface_khr::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<Arc<Self>> {
        Self::new_with_extensions(instance_extensions, move |entry, instance, physical_devices| {
            let surface_loader = surface_loader_factory(entry, instance);
            for &physical_device in physical_devices {
                let props = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
                for (i, p) in props.iter().enumerate() {
                    let supports_graphics = p.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                    let supports_present = unsafe {
                        surface_loader
                            .get_physical_device_surface_support(physical_device, i as u32, surface)
                            .unwrap_or(false)
                    };
                    if supports_graphics && supports_present {
                        return Ok(Some((physical_device, i as u32)));
                    }
                }
            }
            Err(Error::ValidationFailed("no queue family supports graphics and present on this surface".into()))
        })
    }

    fn new_with_extensions(
        instance_extensions: &[&'static std::ffi::CStr],
        pick_surface_queue: impl FnOnce(
            &ash::Entry,
            &ash::Instance,
            &[vk::PhysicalDevice],
        ) -> Result<Option<(vk::PhysicalDevice, u32)>>,
    ) -> Result<Arc<Self>> {
        let entry = unsafe { ash::Entry::load().map_err(|e| Error::ValidationFailed(e.to_string()))? };
        let app_name = CString::new("gsg-vk").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_2)
            .application_name(&app_name)
            .engine_name(&app_name);
        let layer_names = validation_layer_names(&entry);
        let layer_ptrs: Vec<*const i8> = layer_names.iter().map(|c| c.as_ptr()).collect();
        let ext_ptrs: Vec<*const i8> = instance_extensions.iter().map(|c| c.as_ptr()).collect();
        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        let instance = unsafe { entry.create_instance(&instance_create_info, None).map_err(Error::from)? };

        let physical_devices = unsafe { instance.enumerate_physical_devices().map_err(Error::from)? };
        if physical_devices.is_empty() {
            return Err(Error::ValidationFailed("no Vulkan physical device found".into()));
        }

        let surface_pick = pick_surface_queue(&entry, &instance, &physical_devices)?;
        let (physical_device, queue_family_index, wants_swapchain) = match surface_pick {
            Some((pd, qf)) => (pd, qf, true),
            None => {
                let pd = physical_devices[0];
                let props = unsafe { instance.get_physical_device_queue_family_properties(pd) };
                let qf = props
                    .iter()
                    .position(|p| {
                        p.queue_flags.contains(vk::QueueFlags::GRAPHICS) || p.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    })
                    .ok_or_else(|| Error::ValidationFailed("no suitable queue family".into()))? as u32;
                (pd, qf, false)
            }
        };

        let queue_family_properties = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let transfer_family_index = pick_transfer_family(&queue_family_properties, queue_family_index);

        let queue_priorities = [1.0f32];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];
        if let Some(tf) = transfer_family_index {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default().queue_family_index(tf).queue_priorities(&queue_priorities),
            );
        }

        let swapchain_ext = swapchain_khr::NAME.as_ptr();
        let device_ext_ptrs: Vec<*const i8> = if wants_swapchain { vec![swapchain_ext] } else { Vec::new() };
        let device_create_info =
            vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos).enabled_extension_names(&device_ext_ptrs);
        let device_raw = unsafe { instance.create_device(physical_device, &device_create_info, None).map_err(Error::from)? };

        let queue = unsafe { device_raw.get_device_queue(queue_family_index, 0) };
        let (transfer_queue, transfer_command_pool) = match transfer_family_index {
            Some(tf) => {
                let tq = unsafe { device_raw.get_device_queue(tf, 0) };
                let pool_info = vk::CommandPoolCreateInfo::default()
                    .queue_family_index(tf)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
                let pool = unsafe { device_raw.create_command_pool(&pool_info, None).map_err(Error::from)? };
                (Some(tq), Some(pool))
            }
            None => (None, None),
        };

        let command_pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device_raw.create_command_pool(&command_pool_create_info, None).map_err(Error::from)? };

        log::debug!(
            "gsg device created: queue_family={queue_family_index}, transfer_family={:?}, swapchain={wants_swapchain}",
            transfer_family_index
        );

        Ok(Arc::new(Self {
            entry,
            instance,
            physical_device,
            device: Arc::new(device_raw),
            queue,
            queue_family_index,
            transfer_queue,
            transfer_command_pool,
            command_pool,
            next_id: Arc::new(AtomicU64::new(1)),
        }))
    }

    pub fn next_id(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    pub fn next_id_counter(&self) -> Arc<AtomicU64> {
        self.next_id.clone()
    }

    pub fn swapchain_loader(&self) -> swapchain_khr::Device {
        swapchain_khr::Device::new(&self.instance, &self.device)
    }
}

impl Drop for GsgDevice {
    fn drop(&mut self) {
        unsafe {
            if let Some(pool) = self.transfer_command_pool {
                self.device.destroy_command_pool(pool, None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_family_excludes_graphics_family() {
        let props = vec![
            vk::QueueFamilyProperties { queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, ..Default::default() },
            vk::QueueFamilyProperties { queue_flags: vk::QueueFlags::TRANSFER, ..Default::default() },
        ];
        assert_eq!(pick_transfer_family(&props, 0), Some(1));
    }

    #[test]
    fn no_dedicated_transfer_family_returns_none() {
        let props = vec![vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            ..Default::default()
        }];
        assert_eq!(pick_transfer_family(&props, 0), None);
    }
}

//! Vulkan backend implementation using ash
//!
//! Every object handed out through [`GpuBackend`] lives in a per-kind map
//! keyed by handle id. Buffers are host visible and persistently mapped;
//! images are device local and get their pixels through a staging copy.

mod conversion;

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{surface, swapchain};
use ash::vk;
use conversion::*;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CString;

const DESCRIPTOR_POOL_CAPACITY: u32 = 256;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Mutex<Allocator>>,
    max_image_dimension: u32,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    vsync: bool,

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    samplers: HashMap<u64, vk::Sampler>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_sets: HashMap<u64, vk::DescriptorSet>,
    pipelines: HashMap<u64, VkPipeline>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,

    next_id: u64,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
    format: TextureFormat,
    extent: Extent2d,
}

#[derive(Clone, Copy)]
struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

fn lookup<T: Copy>(map: &HashMap<u64, T>, id: u64, kind: &str) -> BackendResult<T> {
    map.get(&id)
        .copied()
        .ok_or_else(|| BackendError::InvalidHandle(format!("{} {}", kind, id)))
}

impl VulkanBackend {
    /// Create the instance, device and swapchain for `window`.
    pub fn new(window: &winit::window::Window, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo {
                p_application_name: c"SDF Renderer".as_ptr(),
                application_version: vk::make_api_version(0, 0, 1, 0),
                p_engine_name: c"sdf-renderer".as_ptr(),
                engine_version: vk::make_api_version(0, 0, 1, 0),
                api_version: vk::API_VERSION_1_2,
                ..Default::default()
            };

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let physical_devices = instance
                .enumerate_physical_devices()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let (physical_device, graphics_queue_family) = physical_devices
                .into_iter()
                .find_map(|pd| {
                    Self::find_queue_family(&instance, pd, &surface_fn, surface)
                        .map(|family| (pd, family))
                })
                .ok_or_else(|| {
                    BackendError::InitializationFailed("No suitable physical device".into())
                })?;

            let properties = instance.get_physical_device_properties(physical_device);
            let max_image_dimension = properties.limits.max_image_dimension2_d;
            log::info!(
                "Using {:?} (max image dimension {})",
                properties.device_name_as_c_str().unwrap_or(c"unknown"),
                max_image_dimension
            );

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: graphics_queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures::default();

            let device_info = vk::DeviceCreateInfo {
                queue_create_info_count: 1,
                p_queue_create_infos: &queue_info,
                enabled_extension_count: device_extensions.len() as u32,
                pp_enabled_extension_names: device_extensions.as_ptr(),
                p_enabled_features: &device_features,
                ..Default::default()
            };

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: graphics_queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };

            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY * 4,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: DESCRIPTOR_POOL_CAPACITY * 2,
                },
            ];

            let descriptor_pool_info = vk::DescriptorPoolCreateInfo {
                pool_size_count: pool_sizes.len() as u32,
                p_pool_sizes: pool_sizes.as_ptr(),
                max_sets: DESCRIPTOR_POOL_CAPACITY,
                flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                ..Default::default()
            };

            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Mutex::new(allocator)),
                max_image_dimension,
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                vsync,
                command_pool,
                descriptor_pool,
                buffers: HashMap::new(),
                images: HashMap::new(),
                samplers: HashMap::new(),
                render_passes: HashMap::new(),
                framebuffers: HashMap::new(),
                descriptor_set_layouts: HashMap::new(),
                descriptor_sets: HashMap::new(),
                pipelines: HashMap::new(),
                command_buffers: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                next_id: 1,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;

            Ok(backend)
        }
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the command pool
    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn raw_render_pass(&self, render_pass: RenderPassHandle) -> Option<vk::RenderPass> {
        self.render_passes.get(&render_pass.0).copied()
    }

    pub fn raw_command_buffer(&self, command_buffer: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(&command_buffer.0).copied()
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Mutex<Allocator>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn recording(&self, command_buffer: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        let cmd = self.raw_command_buffer(command_buffer);
        if cmd.is_none() {
            log::error!("Recording into unknown command buffer {:?}", command_buffer);
        }
        cmd
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families.iter().enumerate().find_map(|(index, family)| {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (supports_graphics && supports_surface).then_some(index as u32)
        })
    }

    fn destroy_swapchain_objects(&mut self) {
        unsafe {
            for view in self.swapchain_image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
            self.swapchain_images.clear();
        }
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| BackendError::SyncFailed(e.to_string()))?;

            self.destroy_swapchain_objects();

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            // Prefer an sRGB surface
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("Surface reports no formats".into())
                })?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .or_else(|| {
                        present_modes
                            .iter()
                            .copied()
                            .find(|&m| m == vk::PresentModeKHR::IMMEDIATE)
                    })
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let swapchain_info = vk::SwapchainCreateInfoKHR {
                surface: self.surface,
                min_image_count: image_count,
                image_format: format.format,
                image_color_space: format.color_space,
                image_extent: extent,
                image_array_layers: 1,
                image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                image_sharing_mode: vk::SharingMode::EXCLUSIVE,
                pre_transform: capabilities.current_transform,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                present_mode,
                clipped: vk::TRUE,
                ..Default::default()
            };

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| self.create_view(image, format.format))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            log::info!(
                "Swapchain {}x{} with {} images ({:?}, {:?})",
                extent.width,
                extent.height,
                self.swapchain_images.len(),
                format.format,
                present_mode
            );

            Ok(())
        }
    }

    fn create_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView, vk::Result> {
        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            components: vk::ComponentMapping::default(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&view_info, None) }
    }

    fn record_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        let (src_access_mask, src_stage) = layout_access(old_layout);
        let (dst_access_mask, dst_stage) = layout_access(new_layout);
        let barrier = vk::ImageMemoryBarrier {
            src_access_mask,
            dst_access_mask,
            old_layout: convert_layout(old_layout),
            new_layout: convert_layout(new_layout),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn begin_single_time_commands(&self) -> BackendResult<vk::CommandBuffer> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo {
                command_pool: self.command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: 1,
                ..Default::default()
            };

            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))?[0];

            let begin_info = vk::CommandBufferBeginInfo {
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))?;

            Ok(cmd)
        }
    }

    fn end_single_time_commands(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        let result = unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))
                .and_then(|_| {
                    let submit_info = vk::SubmitInfo {
                        command_buffer_count: 1,
                        p_command_buffers: &cmd,
                        ..Default::default()
                    };
                    self.device
                        .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                        .map_err(|e| BackendError::SubmitFailed(e.to_string()))
                })
                .and_then(|_| {
                    self.device
                        .queue_wait_idle(self.graphics_queue)
                        .map_err(|e| BackendError::SyncFailed(e.to_string()))
                })
        };
        unsafe {
            self.device.free_command_buffers(self.command_pool, &[cmd]);
        }
        result
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> BackendResult<Allocation> {
        self.allocator()?
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
                other => BackendError::BufferCreationFailed(other.to_string()),
            })
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = &self.allocator {
            if let Err(e) = allocator.lock().free(allocation) {
                log::warn!("Failed to free allocation: {}", e);
            }
        }
    }

    fn create_raw_buffer(&self, desc: &BufferDescriptor) -> BackendResult<VkBuffer> {
        unsafe {
            let buffer_info = vk::BufferCreateInfo {
                size: desc.size,
                usage: convert_buffer_usage(desc.usage),
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                ..Default::default()
            };

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let allocation = match self.allocate(
                desc.label.as_deref().unwrap_or("buffer"),
                requirements,
                MemoryLocation::CpuToGpu,
                true,
            ) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                self.free_allocation(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            Ok(VkBuffer {
                buffer,
                allocation,
                size: desc.size,
            })
        }
    }

    fn destroy_raw_buffer(&self, buffer: VkBuffer) {
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        self.free_allocation(buffer.allocation);
    }

    fn create_shader_module(&self, source: &ShaderModuleSource) -> BackendResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(&source.spirv);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))
    }

    fn build_pipeline(
        &self,
        desc: &PipelineDescriptor,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
        pipeline_layout: vk::PipelineLayout,
    ) -> BackendResult<vk::Pipeline> {
        let render_pass = lookup(&self.render_passes, desc.render_pass.0, "render pass")?;

        let vertex_entry = CString::new(desc.vertex.entry_point.as_str())
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let fragment_entry = CString::new(desc.fragment.entry_point.as_str())
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(&fragment_entry),
        ];

        let binding_descriptions = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(desc.vertex_layout.array_stride as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];

        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attr| {
                vk::VertexInputAttributeDescription::default()
                    .location(attr.location)
                    .binding(0)
                    .format(convert_vertex_format(attr.format))
                    .offset(attr.offset as u32)
            })
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert_topology(desc.topology))
            .primitive_restart_enable(false);

        // Dynamic viewport and scissor
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..desc
            .color_target_count)
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
            })
            .collect();

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| {
            BackendError::PipelineCreationFailed(format!(
                "{}: {:?}",
                desc.label.as_deref().unwrap_or("pipeline"),
                e
            ))
        })?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::PipelineCreationFailed("No pipeline returned".into()))
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn swapchain_image_count(&self) -> u32 {
        self.swapchain_images.len() as u32
    }

    fn swapchain_extent(&self) -> Extent2d {
        Extent2d::new(self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        convert_format_back(self.swapchain_format)
    }

    fn max_image_dimension(&self) -> u32 {
        self.max_image_dimension
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.create_raw_buffer(desc)?;
        let id = self.next_handle();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let size = vk_buffer.size;
        let mapped = vk_buffer.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::BufferCreationFailed(format!("{:?} is not host mapped", buffer))
        })?;

        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > size || end > mapped.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                size
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        unsafe {
            let format = convert_format(desc.format);
            let image_info = vk::ImageCreateInfo {
                image_type: vk::ImageType::TYPE_2D,
                extent: vk::Extent3D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                initial_layout: vk::ImageLayout::UNDEFINED,
                usage: convert_image_usage(desc.usage),
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                samples: vk::SampleCountFlags::TYPE_1,
                ..Default::default()
            };

            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))?;

            let requirements = self.device.get_image_memory_requirements(image);
            let allocation = match self.allocate(
                desc.label.as_deref().unwrap_or("image"),
                requirements,
                MemoryLocation::GpuOnly,
                false,
            ) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };

            let bound = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))
                .and_then(|_| {
                    self.create_view(image, format)
                        .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))
                });
            let view = match bound {
                Ok(view) => view,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    self.free_allocation(allocation);
                    return Err(e);
                }
            };

            let id = self.next_handle();
            self.images.insert(
                id,
                VkImage {
                    image,
                    view,
                    allocation,
                    format: desc.format,
                    extent: desc.extent,
                },
            );
            Ok(ImageHandle(id))
        }
    }

    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> BackendResult<()> {
        let (raw_image, format, extent) = self
            .images
            .get(&image.0)
            .map(|i| (i.image, i.format, i.extent))
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", image)))?;

        let expected = (extent.width * extent.height * format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(BackendError::ImageCreationFailed(format!(
                "upload of {} bytes to a {}x{} image expecting {}",
                data.len(),
                extent.width,
                extent.height,
                expected
            )));
        }

        let mut staging = self.create_raw_buffer(&BufferDescriptor {
            label: Some("Staging".into()),
            size: data.len() as u64,
            usage: BufferUsage::COPY_SRC,
        })?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.destroy_raw_buffer(staging);
                return Err(BackendError::BufferCreationFailed(
                    "Staging buffer is not host mapped".into(),
                ));
            }
        }

        let result = self.begin_single_time_commands().and_then(|cmd| {
            self.record_image_barrier(cmd, raw_image, ImageLayout::Undefined, ImageLayout::TransferDst);
            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            };
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    raw_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            self.record_image_barrier(
                cmd,
                raw_image,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            );
            self.end_single_time_commands(cmd)
        });

        self.destroy_raw_buffer(staging);
        result
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let address_mode = convert_address_mode(desc.address_mode);
        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: convert_filter(desc.mag_filter),
            min_filter: convert_filter(desc.min_filter),
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };

        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .color_attachments
            .iter()
            .map(|a| vk::AttachmentDescription {
                format: convert_format(a.format),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: convert_layout(a.initial_layout),
                final_layout: convert_layout(a.final_layout),
                ..Default::default()
            })
            .collect();

        let attachment_refs: Vec<vk::AttachmentReference> = (0..attachments.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let subpass = vk::SubpassDescription {
            pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
            color_attachment_count: attachment_refs.len() as u32,
            p_color_attachments: attachment_refs.as_ptr(),
            ..Default::default()
        };

        // Writes wait for earlier reads of the same images; later fragment
        // reads wait for the writes.
        let dependencies = [
            vk::SubpassDependency {
                src_subpass: vk::SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::FRAGMENT_SHADER,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ..Default::default()
            },
            vk::SubpassDependency {
                src_subpass: 0,
                dst_subpass: vk::SUBPASS_EXTERNAL,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                ..Default::default()
            },
        ];

        let render_pass_info = vk::RenderPassCreateInfo {
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            subpass_count: 1,
            p_subpasses: &subpass,
            dependency_count: dependencies.len() as u32,
            p_dependencies: dependencies.as_ptr(),
            ..Default::default()
        };

        let render_pass = unsafe {
            self.device
                .create_render_pass(&render_pass_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let render_pass = lookup(&self.render_passes, desc.render_pass.0, "render pass")?;
        let views = desc
            .attachments
            .iter()
            .map(|attachment| match attachment {
                FramebufferAttachment::Image(image) => self
                    .images
                    .get(&image.0)
                    .map(|i| i.view)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", image))),
                FramebufferAttachment::SwapchainImage(index) => self
                    .swapchain_image_views
                    .get(*index as usize)
                    .copied()
                    .ok_or_else(|| {
                        BackendError::InvalidHandle(format!("swapchain image {}", index))
                    }),
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo {
            render_pass,
            attachment_count: views.len() as u32,
            p_attachments: views.as_ptr(),
            width: desc.extent.width,
            height: desc.extent.height,
            layers: 1,
            ..Default::default()
        };

        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(|e| BackendError::ImageCreationFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: convert_descriptor_type(b.ty),
                descriptor_count: 1,
                stage_flags: convert_stage_flags(b.visibility),
                ..Default::default()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: vk_bindings.len() as u32,
            p_bindings: vk_bindings.as_ptr(),
            ..Default::default()
        };

        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.descriptor_set_layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle> {
        let set_layout = lookup(&self.descriptor_set_layouts, layout.0, "descriptor set layout")?;

        let mut buffer_infos = Vec::with_capacity(writes.len());
        let mut image_infos = Vec::with_capacity(writes.len());
        for write in writes {
            match write.resource {
                DescriptorResource::UniformBuffer { buffer, size } => {
                    let raw = self
                        .buffers
                        .get(&buffer.0)
                        .map(|b| b.buffer)
                        .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: raw,
                        offset: 0,
                        range: size,
                    });
                }
                DescriptorResource::SampledImage(image) => {
                    let view = self
                        .images
                        .get(&image.0)
                        .map(|i| i.view)
                        .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", image)))?;
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                }
                DescriptorResource::Sampler(sampler) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: lookup(&self.samplers, sampler.0, "sampler")?,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                }
            }
        }

        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };

        let descriptor_set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| BackendError::DescriptorCreationFailed(e.to_string()))?[0]
        };

        let (mut next_buffer, mut next_image) = (0, 0);
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(write.binding);
                match write.resource {
                    DescriptorResource::UniformBuffer { .. } => {
                        next_buffer += 1;
                        base.descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                            .buffer_info(std::slice::from_ref(&buffer_infos[next_buffer - 1]))
                    }
                    DescriptorResource::SampledImage(_) => {
                        next_image += 1;
                        base.descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                            .image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                    }
                    DescriptorResource::Sampler(_) => {
                        next_image += 1;
                        base.descriptor_type(vk::DescriptorType::SAMPLER)
                            .image_info(std::slice::from_ref(&image_infos[next_image - 1]))
                    }
                }
            })
            .collect();

        unsafe {
            self.device.update_descriptor_sets(&vk_writes, &[]);
        }

        let id = self.next_handle();
        self.descriptor_sets.insert(id, descriptor_set);
        Ok(DescriptorSetHandle(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        let set_layout = lookup(
            &self.descriptor_set_layouts,
            desc.descriptor_set_layout.0,
            "descriptor set layout",
        )?;

        let pipeline_layout_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };

        let layout = unsafe {
            self.device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?
        };

        let modules = self.create_shader_module(&desc.vertex).and_then(|vertex| {
            match self.create_shader_module(&desc.fragment) {
                Ok(fragment) => Ok((vertex, fragment)),
                Err(e) => {
                    unsafe { self.device.destroy_shader_module(vertex, None) };
                    Err(e)
                }
            }
        });

        let pipeline = modules.and_then(|(vertex, fragment)| {
            let pipeline = self.build_pipeline(desc, vertex, fragment, layout);
            unsafe {
                self.device.destroy_shader_module(vertex, None);
                self.device.destroy_shader_module(fragment, None);
            }
            pipeline
        });

        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        log::debug!("Created pipeline {}", desc.label.as_deref().unwrap_or("unnamed"));

        let id = self.next_handle();
        self.pipelines.insert(id, VkPipeline { pipeline, layout });
        Ok(PipelineHandle(id))
    }

    fn allocate_command_buffer(&mut self) -> BackendResult<CommandBufferHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: self.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };

        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?[0]
        };

        let id = self.next_handle();
        self.command_buffers.insert(id, command_buffer);
        Ok(CommandBufferHandle(id))
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let fence_info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };

        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| BackendError::SyncFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe {
            self.device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::SyncFailed(e.to_string()))?
        };

        let id = self.next_handle();
        self.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            self.destroy_raw_buffer(vk_buffer);
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(vk_image) = self.images.remove(&image.0) {
            unsafe {
                self.device.destroy_image_view(vk_image.view, None);
                self.device.destroy_image(vk_image.image, None);
            }
            self.free_allocation(vk_image.allocation);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(render_pass) = self.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(framebuffer) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        if let Some(layout) = self.descriptor_set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if let Some(set) = self.descriptor_sets.remove(&set.0) {
            let freed = unsafe { self.device.free_descriptor_sets(self.descriptor_pool, &[set]) };
            if let Err(e) = freed {
                log::warn!("Failed to free descriptor set: {}", e);
            }
        }
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
        }
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle) {
        if let Some(cmd) = self.command_buffers.remove(&command_buffer.0) {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn wait_for_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = lookup(&self.fences, fence.0, "fence")?;
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    other => BackendError::SyncFailed(other.to_string()),
                })
        }
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = lookup(&self.fences, fence.0, "fence")?;
        unsafe {
            self.device
                .reset_fences(&[fence])
                .map_err(|e| BackendError::SyncFailed(e.to_string()))
        }
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<u32> {
        let semaphore = lookup(&self.semaphores, signal.0, "semaphore")?;
        let (image_index, suboptimal) = unsafe {
            self.swapchain_fn
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceOutdated,
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    other => BackendError::AcquireImageFailed(other.to_string()),
                })?
        };
        if suboptimal {
            log::debug!("Acquired image {} from a suboptimal swapchain", image_index);
        }
        Ok(image_index)
    }

    fn submit(
        &mut self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        let command_buffers = [lookup(&self.command_buffers, command_buffer.0, "command buffer")?];
        let wait_semaphores = [lookup(&self.semaphores, wait.0, "semaphore")?];
        let signal_semaphores = [lookup(&self.semaphores, signal.0, "semaphore")?];
        let fence = lookup(&self.fences, fence.0, "fence")?;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submit_info = vk::SubmitInfo {
            wait_semaphore_count: 1,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: command_buffers.as_ptr(),
            signal_semaphore_count: 1,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    other => BackendError::SubmitFailed(other.to_string()),
                })
        }
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<PresentStatus> {
        let wait_semaphores = [lookup(&self.semaphores, wait.0, "semaphore")?];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            swapchain_count: 1,
            p_swapchains: swapchains.as_ptr(),
            p_image_indices: image_indices.as_ptr(),
            ..Default::default()
        };

        let result = unsafe { self.swapchain_fn.queue_present(self.graphics_queue, &present_info) };
        match result {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(BackendError::SurfaceOutdated),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::PresentFailed(e.to_string())),
        }
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| BackendError::SyncFailed(e.to_string()))
        }
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::SwapchainCreationFailed(format!(
                "surface has zero size ({}x{})",
                width, height
            )));
        }
        self.create_swapchain(width, height)
    }

    fn cmd_begin(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()> {
        let cmd = lookup(&self.command_buffers, command_buffer.0, "command buffer")?;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))?;
            let begin_info = vk::CommandBufferBeginInfo::default();
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))
        }
    }

    fn cmd_end(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()> {
        let cmd = lookup(&self.command_buffers, command_buffer.0, "command buffer")?;
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))
        }
    }

    fn cmd_begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_colors: &[[f32; 4]],
    ) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        let (Some(render_pass), Some(framebuffer)) = (
            self.render_passes.get(&render_pass.0).copied(),
            self.framebuffers.get(&framebuffer.0).copied(),
        ) else {
            log::error!("Render pass begin with unknown pass or framebuffer");
            return;
        };

        let clear_values: Vec<vk::ClearValue> = clear_colors
            .iter()
            .map(|&float32| vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            })
            .collect();

        let render_pass_begin = vk::RenderPassBeginInfo {
            render_pass,
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            },
            clear_value_count: clear_values.len() as u32,
            p_clear_values: clear_values.as_ptr(),
            ..Default::default()
        };

        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&mut self, command_buffer: CommandBufferHandle) {
        if let Some(cmd) = self.recording(command_buffer) {
            unsafe { self.device.cmd_end_render_pass(cmd) };
        }
    }

    fn cmd_bind_pipeline(&mut self, command_buffer: CommandBufferHandle, pipeline: PipelineHandle) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        match self.pipelines.get(&pipeline.0) {
            Some(p) => unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.pipeline);
            },
            None => log::error!("Binding unknown pipeline {:?}", pipeline),
        }
    }

    fn cmd_set_viewport_scissor(&mut self, command_buffer: CommandBufferHandle, extent: Extent2d) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: CommandBufferHandle,
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
    ) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        let (Some(p), Some(set)) = (
            self.pipelines.get(&pipeline.0),
            self.descriptor_sets.get(&set.0).copied(),
        ) else {
            log::error!("Binding descriptor set {:?} with unknown pipeline or set", set);
            return;
        };
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                p.layout,
                0,
                &[set],
                &[],
            );
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, command_buffer: CommandBufferHandle, buffer: BufferHandle) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(b) => unsafe {
                self.device.cmd_bind_vertex_buffers(cmd, 0, &[b.buffer], &[0]);
            },
            None => log::error!("Binding unknown vertex buffer {:?}", buffer),
        }
    }

    fn cmd_draw(&mut self, command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        if let Some(cmd) = self.recording(command_buffer) {
            unsafe { self.device.cmd_draw(cmd, vertex_count, instance_count, 0, 0) };
        }
    }

    fn cmd_transition_image(
        &mut self,
        command_buffer: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        let Some(cmd) = self.recording(command_buffer) else {
            return;
        };
        match self.images.get(&image.0) {
            Some(i) => self.record_image_barrier(cmd, i.image, old_layout, new_layout),
            None => log::error!("Transitioning unknown image {:?}", image),
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let leaked = self.buffers.len()
                + self.images.len()
                + self.pipelines.len()
                + self.framebuffers.len();
            if leaked > 0 {
                log::warn!("{} GPU objects still alive at backend shutdown", leaked);
            }

            for (_, buffer) in std::mem::take(&mut self.buffers) {
                self.destroy_raw_buffer(buffer);
            }
            for (_, image) in std::mem::take(&mut self.images) {
                self.device.destroy_image_view(image.view, None);
                self.device.destroy_image(image.image, None);
                self.free_allocation(image.allocation);
            }

            // Drop the allocator before destroying the device
            drop(self.allocator.take());

            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.descriptor_sets.clear();
            self.command_buffers.clear();

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);

            self.destroy_swapchain_objects();

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

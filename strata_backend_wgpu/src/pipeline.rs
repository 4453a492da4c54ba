// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Render pipelines, bind group layouts, and the per-frame buffer pool.

use bytemuck::{Pod, Zeroable};

use strata_core::batch::{ColorVertex, TextureVertex};

/// Quads sample the atlas with nearest filtering and modulate by the layer
/// opacity; colors are premultiplied throughout.
const TEXTURE_SHADER: &str = r"
struct Globals {
    scale: vec2<f32>,
    offset: vec2<f32>,
    opacity: f32,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(1) @binding(0) var atlas_texture: texture_2d<f32>;
@group(1) @binding(1) var atlas_sampler: sampler;

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4(in.position * globals.scale + globals.offset, 0.0, 1.0);
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(atlas_texture, atlas_sampler, in.uv) * globals.opacity;
}
";

/// Flat quads carry their color (already premultiplied by the layer
/// opacity) per vertex; `Unorm8x4` over the packed ARGB little-endian
/// bytes arrives as (b, g, r, a).
const COLOR_SHADER: &str = r"
struct Globals {
    scale: vec2<f32>,
    offset: vec2<f32>,
    opacity: f32,
}

@group(0) @binding(0) var<uniform> globals: Globals;

struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) color: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) color: vec4<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4(in.position * globals.scale + globals.offset, 0.0, 1.0);
    out.color = vec4(in.color.z, in.color.y, in.color.x, in.color.w);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return in.color;
}
";

/// Uniform block shared by both pipelines; one 256-byte slot per layer
/// state so every batched draw binds its own transform and opacity via a
/// dynamic offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct Globals {
    pub(crate) scale: [f32; 2],
    pub(crate) offset: [f32; 2],
    pub(crate) opacity: f32,
    pub(crate) _pad: [f32; 3],
}

/// Dynamic-offset stride for [`Globals`] slots.
pub(crate) const GLOBALS_STRIDE: u32 = 256;

/// Premultiplied source-over.
const PREMULTIPLIED_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

/// The four pipelines (textured/flat x src-over/copy) for one target
/// format.
pub(crate) struct FormatPipelines {
    pub(crate) format: wgpu::TextureFormat,
    pub(crate) textured_src_over: wgpu::RenderPipeline,
    pub(crate) textured_copy: wgpu::RenderPipeline,
    pub(crate) color_src_over: wgpu::RenderPipeline,
    pub(crate) color_copy: wgpu::RenderPipeline,
}

/// Device objects shared by every frame: layouts, sampler, shader modules,
/// and the pipelines built per encountered target format.
pub(crate) struct GpuState {
    pub(crate) globals_layout: wgpu::BindGroupLayout,
    pub(crate) texture_layout: wgpu::BindGroupLayout,
    pub(crate) sampler: wgpu::Sampler,
    texture_shader: wgpu::ShaderModule,
    color_shader: wgpu::ShaderModule,
    pipeline_layout_textured: wgpu::PipelineLayout,
    pipeline_layout_color: wgpu::PipelineLayout,
    formats: Vec<FormatPipelines>,
}

impl GpuState {
    pub(crate) fn new(device: &wgpu::Device) -> Self {
        let globals_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("strata globals layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("strata atlas layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        // Atlas slots must never bleed into their neighbors.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("strata atlas sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("strata textured quad shader"),
            source: wgpu::ShaderSource::Wgsl(TEXTURE_SHADER.into()),
        });
        let color_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("strata color quad shader"),
            source: wgpu::ShaderSource::Wgsl(COLOR_SHADER.into()),
        });

        let pipeline_layout_textured =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("strata textured layout"),
                bind_group_layouts: &[&globals_layout, &texture_layout],
                push_constant_ranges: &[],
            });
        let pipeline_layout_color =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("strata color layout"),
                bind_group_layouts: &[&globals_layout],
                push_constant_ranges: &[],
            });

        Self {
            globals_layout,
            texture_layout,
            sampler,
            texture_shader,
            color_shader,
            pipeline_layout_textured,
            pipeline_layout_color,
            formats: Vec::new(),
        }
    }

    /// Builds the pipeline set for `format` if this is its first use.
    pub(crate) fn prepare(&mut self, device: &wgpu::Device, format: wgpu::TextureFormat) {
        if self.formats.iter().any(|p| p.format == format) {
            return;
        }

        let textured_src_over = self.build_pipeline(
            device,
            format,
            true,
            Some(PREMULTIPLIED_BLEND),
            "strata textured src-over",
        );
        let textured_copy =
            self.build_pipeline(device, format, true, None, "strata textured copy");
        let color_src_over = self.build_pipeline(
            device,
            format,
            false,
            Some(PREMULTIPLIED_BLEND),
            "strata color src-over",
        );
        let color_copy = self.build_pipeline(device, format, false, None, "strata color copy");

        self.formats.push(FormatPipelines {
            format,
            textured_src_over,
            textured_copy,
            color_src_over,
            color_copy,
        });
    }

    /// The pipeline set for a prepared `format`.
    ///
    /// # Panics
    ///
    /// Panics if [`prepare`](Self::prepare) has not run for `format`.
    pub(crate) fn pipelines(&self, format: wgpu::TextureFormat) -> &FormatPipelines {
        self.formats
            .iter()
            .find(|p| p.format == format)
            .expect("pipelines not prepared for this format")
    }

    fn build_pipeline(
        &self,
        device: &wgpu::Device,
        format: wgpu::TextureFormat,
        textured: bool,
        blend: Option<wgpu::BlendState>,
        label: &str,
    ) -> wgpu::RenderPipeline {
        let (module, layout, stride, attributes): (_, _, u64, &[wgpu::VertexAttribute]) =
            if textured {
                (
                    &self.texture_shader,
                    &self.pipeline_layout_textured,
                    size_of::<TextureVertex>() as u64,
                    &[
                        wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Float32x2,
                            offset: 0,
                            shader_location: 0,
                        },
                        wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Float32x2,
                            offset: 8,
                            shader_location: 1,
                        },
                    ],
                )
            } else {
                (
                    &self.color_shader,
                    &self.pipeline_layout_color,
                    size_of::<ColorVertex>() as u64,
                    &[
                        wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Float32x2,
                            offset: 0,
                            shader_location: 0,
                        },
                        wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Unorm8x4,
                            offset: 8,
                            shader_location: 1,
                        },
                    ],
                )
            };

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: stride,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes,
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_fit_one_dynamic_slot() {
        assert_eq!(size_of::<Globals>(), 32);
        assert!(size_of::<Globals>() as u64 <= u64::from(GLOBALS_STRIDE));
    }

    #[test]
    fn shaders_declare_both_entry_points() {
        for shader in [TEXTURE_SHADER, COLOR_SHADER] {
            assert!(shader.contains("fn vs_main"));
            assert!(shader.contains("fn fs_main"));
        }
    }
}

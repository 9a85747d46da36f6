//! Offscreen triangle: renders one hard-coded triangle into a render-target
//! texture on a headless `Gsg`, reads it back to RAM, and reports the center
//! pixel. Grounded on the teacher's `lume-examples/src/bin/triangle_graphics.rs`
//! (same WGSL-via-naga shader compilation, same offscreen-render-target flow),
//! adapted from the teacher's `Device`/`CommandEncoder` trait calls to this
//! crate's `Gsg` entry points.

use gsg_vk::scene_types::{
    GeomPrimitive, GeomVertexArrayFormat, GeomVertexColumn, GeomVertexFormat, IndexFormat, NumericType,
    PrimitiveTopology, Shader, ShaderStage, Texture, TextureFormat, VertexInputRate,
};
use gsg_vk::{ColorTarget, DrawInput, GsgConfig, RenderTargets};

fn compile_wgsl_to_spirv(source: &str, stage: naga::ShaderStage) -> Vec<u32> {
    let module = naga::front::wgsl::parse_str(source).expect("parse wgsl");
    let info = naga::valid::Validator::new(naga::valid::ValidationFlags::default(), naga::valid::Capabilities::default())
        .validate(&module)
        .expect("validate");
    let options = naga::back::spv::Options::default();
    let pipeline_options = naga::back::spv::PipelineOptions { shader_stage: stage, entry_point: "main".to_string() };
    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).expect("compile to spirv")
}

fn vertex_spirv() -> Vec<u32> {
    let wgsl = r#"
        @vertex
        fn main(@location(0) pos: vec3<f32>) -> @builtin(position) vec4<f32> {
            return vec4<f32>(pos, 1.0);
        }
    "#;
    compile_wgsl_to_spirv(wgsl, naga::ShaderStage::Vertex)
}

fn fragment_spirv() -> Vec<u32> {
    let wgsl = r#"
        @fragment
        fn main() -> @location(0) vec4<f32> {
            return vec4<f32>(1.0, 0.0, 0.0, 1.0);
        }
    "#;
    compile_wgsl_to_spirv(wgsl, naga::ShaderStage::Fragment)
}

fn main() {
    env_logger::init();

    let mut gsg = gsg_vk::Gsg::new(GsgConfig::default()).expect("Gsg::new (headless)");

    let render_target_id = gsg.next_resource_id();
    gsg.create_texture(&Texture {
        id: render_target_id,
        format: TextureFormat::Rgba8Unorm,
        extent: (256, 256, 1),
        mip_levels: 1,
        array_layers: 1,
        initial_data: None,
    })
    .expect("create_texture");

    let shader = Shader {
        vertex: ShaderStage { spirv: vertex_spirv(), entry_point: "main".to_string() },
        fragment: ShaderStage { spirv: fragment_spirv(), entry_point: "main".to_string() },
    };

    let vertex_format = GeomVertexFormat {
        arrays: vec![GeomVertexArrayFormat {
            stride: 12,
            input_rate: VertexInputRate::PerVertex,
            columns: vec![GeomVertexColumn {
                name: "pos",
                numeric_type: NumericType::Float32,
                num_components: 3,
                offset: 0,
                location: 0,
            }],
        }],
    };

    #[rustfmt::skip]
    let vertices: [f32; 9] = [
        0.0, -0.5, 0.0,
        0.5,  0.5, 0.0,
       -0.5,  0.5, 0.0,
    ];
    let vertex_bytes: &[u8] = bytemuck_like_slice(&vertices);
    let vertex_buffer_id = gsg.next_resource_id();

    let primitive = GeomPrimitive {
        topology: PrimitiveTopology::TriangleList,
        index_format: None::<IndexFormat>,
        vertex_count: 3,
        first_vertex: 0,
        instance_count: 1,
    };

    gsg.begin_frame().expect("begin_frame");
    gsg.begin_render_cmd(&RenderTargets {
        colors: &[ColorTarget::Texture(render_target_id)],
        depth: None,
        clear_colors: &[[0.1, 0.2, 0.4, 1.0]],
        clear_depth: None,
    })
    .expect("begin_render_cmd");

    gsg.draw(DrawInput {
        shader: &shader,
        vertex_format: &vertex_format,
        vertex_buffers: &[(vertex_buffer_id, vertex_bytes)],
        index_buffer: None,
        primitive: &primitive,
        bindings: &[],
    })
    .expect("draw");

    gsg.end_render_cmd().expect("end_render_cmd");
    let screenshot = gsg.framebuffer_copy_to_ram(render_target_id, 4).expect("framebuffer_copy_to_ram");
    gsg.end_frame().expect("end_frame");

    // The readback resolves once this frame's slot recycles; drive a couple
    // more empty frames so its fence signals and `begin_frame` drains it.
    let mut bytes = None;
    for _ in 0..4 {
        gsg.begin_frame().expect("begin_frame");
        gsg.end_frame().expect("end_frame");
        if let Some(b) = screenshot.try_recv() {
            bytes = Some(b);
            break;
        }
    }

    match bytes {
        Some(b) => {
            let center = (128 * 256 + 128) * 4;
            log::info!("center pixel rgba = {:?}", &b[center..center + 4]);
            println!("triangle demo OK, read back {} bytes", b.len());
        }
        None => println!("triangle demo: screenshot did not resolve in time"),
    }
}

fn bytemuck_like_slice(data: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

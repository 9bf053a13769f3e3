use std::{env, fs, path::PathBuf};

// Shared GLSL declarations. Layouts mirror the Rust structs in torrent-render:
//   Vertex 16 B, Meshlet 32 B, MeshDraw 64 B, push constants 96 B.
// Bindings: 0 draws, 1 meshlets, 2 meshlet data, 3 vertices.
const COMMON: &str = r#"
layout(push_constant) uniform Globals {
    mat4 viewProjection;
    vec4 cameraPosition;
    uint meshletCount;
    uint coneCulling;
} globals;

struct Vertex {
    uint positionXY;
    uint positionZW;
    uint normal;
    uint texcoord;
};

struct Meshlet {
    vec4 sphere;
    uint cone;
    uint dataOffset;
    uint counts;
    uint reserved;
};

struct MeshDraw {
    vec3 position;
    float scale;
    vec4 orientation;
    uint command[5];
    uint pad[3];
};

vec3 rotateQuat(vec3 v, vec4 q) {
    return v + 2.0 * cross(q.xyz, cross(q.xyz, v) + q.w * v);
}

vec3 vertexPosition(Vertex v) {
    return vec3(unpackHalf2x16(v.positionXY), unpackHalf2x16(v.positionZW).x);
}

vec3 vertexNormal(Vertex v) {
    return unpackUnorm4x8(v.normal).xyz * 2.0 - 1.0;
}
"#;

// Indexed path: vertex pulling, draw index arrives through firstInstance.
const MESH_VERT: &str = r#"
layout(std430, set = 0, binding = 0) readonly buffer Draws { MeshDraw draws[]; };
layout(std430, set = 0, binding = 3) readonly buffer Vertices { Vertex vertices[]; };

layout(location = 0) out vec3 vColor;

void main() {
    MeshDraw draw = draws[gl_InstanceIndex];
    Vertex v = vertices[gl_VertexIndex];

    vec3 world = rotateQuat(vertexPosition(v), draw.orientation) * draw.scale + draw.position;
    gl_Position = globals.viewProjection * vec4(world, 1.0);
    vColor = rotateQuat(vertexNormal(v), draw.orientation) * 0.5 + 0.5;
}
"#;

// Cluster path, stage 1: one invocation per meshlet, cone test, compact
// survivors into the payload.
const MESHLET_TASK: &str = r#"
layout(local_size_x = 32) in;

layout(std430, set = 0, binding = 0) readonly buffer Draws { MeshDraw draws[]; };
layout(std430, set = 0, binding = 1) readonly buffer Meshlets { Meshlet meshlets[]; };

struct TaskPayload {
    uint drawId;
    uint meshletIndices[32];
};
taskPayloadSharedEXT TaskPayload payload;

shared uint visibleCount;

bool coneCull(vec3 center, float radius, vec3 axis, float cutoff, vec3 camera) {
    return dot(center - camera, axis) >= cutoff * length(center - camera) + radius;
}

void main() {
    uint drawId = gl_DrawIDARB;
    uint mi = gl_GlobalInvocationID.x;

    if (gl_LocalInvocationIndex == 0) {
        visibleCount = 0;
        payload.drawId = drawId;
    }
    barrier();

    MeshDraw draw = draws[drawId];
    Meshlet m = meshlets[mi];
    uint triangleCount = (m.counts >> 8) & 0xff;

    bool visible = mi < globals.meshletCount && triangleCount > 0;
    if (visible && globals.coneCulling != 0) {
        vec3 center = rotateQuat(m.sphere.xyz, draw.orientation) * draw.scale + draw.position;
        float radius = m.sphere.w * draw.scale;
        vec4 cone = unpackSnorm4x8(m.cone);
        vec3 axis = rotateQuat(cone.xyz, draw.orientation);
        visible = !coneCull(center, radius, axis, cone.w, globals.cameraPosition.xyz);
    }

    if (visible) {
        uint slot = atomicAdd(visibleCount, 1);
        payload.meshletIndices[slot] = mi;
    }
    barrier();

    EmitMeshTasksEXT(visibleCount, 1, 1);
}
"#;

// Cluster path, stage 2: expand one meshlet.
const MESHLET_MESH: &str = r#"
layout(local_size_x = 32) in;
layout(triangles, max_vertices = 64, max_primitives = 124) out;

layout(std430, set = 0, binding = 0) readonly buffer Draws { MeshDraw draws[]; };
layout(std430, set = 0, binding = 1) readonly buffer Meshlets { Meshlet meshlets[]; };
layout(std430, set = 0, binding = 2) readonly buffer MeshletData { uint meshletData[]; };
layout(std430, set = 0, binding = 3) readonly buffer Vertices { Vertex vertices[]; };

struct TaskPayload {
    uint drawId;
    uint meshletIndices[32];
};
taskPayloadSharedEXT TaskPayload payload;

layout(location = 0) out vec3 vColor[];

void main() {
    MeshDraw draw = draws[payload.drawId];
    Meshlet m = meshlets[payload.meshletIndices[gl_WorkGroupID.x]];

    uint vertexCount = m.counts & 0xff;
    uint triangleCount = (m.counts >> 8) & 0xff;
    SetMeshOutputsEXT(vertexCount, triangleCount);

    for (uint i = gl_LocalInvocationIndex; i < vertexCount; i += 32) {
        Vertex v = vertices[meshletData[m.dataOffset + i]];
        vec3 world = rotateQuat(vertexPosition(v), draw.orientation) * draw.scale + draw.position;
        gl_MeshVerticesEXT[i].gl_Position = globals.viewProjection * vec4(world, 1.0);
        vColor[i] = rotateQuat(vertexNormal(v), draw.orientation) * 0.5 + 0.5;
    }

    uint indexBase = m.dataOffset + vertexCount;
    for (uint i = gl_LocalInvocationIndex; i < triangleCount; i += 32) {
        uvec3 tri;
        for (uint k = 0; k < 3; ++k) {
            uint idx = i * 3 + k;
            tri[k] = (meshletData[indexBase + idx / 4] >> ((idx % 4) * 8)) & 0xff;
        }
        gl_PrimitiveTriangleIndicesEXT[i] = tri;
    }
}
"#;

const MESH_FRAG: &str = r#"
layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();

    // Mesh shading needs SPIR-V 1.4+
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    opts.set_target_spirv(shaderc::SpirvVersion::V1_5);
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let mesh_ext = "#extension GL_EXT_mesh_shader : require\n";
    let task_ext = "#extension GL_EXT_mesh_shader : require\n\
                    #extension GL_ARB_shader_draw_parameters : require\n";

    // (file, stage, extensions, body, needs COMMON)
    let shaders = [
        ("mesh.vert", shaderc::ShaderKind::Vertex, "", MESH_VERT, true),
        ("meshlet.task", shaderc::ShaderKind::Task, task_ext, MESHLET_TASK, true),
        ("meshlet.mesh", shaderc::ShaderKind::Mesh, mesh_ext, MESHLET_MESH, true),
        ("mesh.frag", shaderc::ShaderKind::Fragment, "", MESH_FRAG, false),
    ];

    for (name, kind, extensions, body, common) in shaders {
        // #extension must precede every declaration
        let src = format!(
            "#version 460\n{}{}\n{}",
            extensions,
            if common { COMMON } else { "" },
            body
        );
        let spv = comp
            .compile_into_spirv(&src, kind, name, "main", Some(&opts))
            .unwrap();
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).unwrap();
    }

    // Re-run if this file changes (inline sources live here)
    println!("cargo:rerun-if-changed=build.rs");
}

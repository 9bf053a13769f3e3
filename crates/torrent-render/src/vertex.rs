// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use torrent_math::{dequantize_half, encode_unorm8, quantize_half};

/// GPU vertex, 16 bytes. Shaders read it as four `uint`s from a storage
/// buffer, so field order and packing are fixed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Vertex {
    /// Half floats, `w = 1.0`.
    pub position: [u16; 4],
    /// Unsigned bytes, `round(n * 127.5 + 127.5)`, `w` unused.
    pub normal: [u8; 4],
    pub texcoord: [u16; 2],
}

const _: () = assert!(std::mem::size_of::<Vertex>() == 16);

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], texcoord: [f32; 2]) -> Self {
        Vertex {
            position: [
                quantize_half(position[0]),
                quantize_half(position[1]),
                quantize_half(position[2]),
                quantize_half(1.0),
            ],
            normal: [
                encode_unorm8(normal[0]),
                encode_unorm8(normal[1]),
                encode_unorm8(normal[2]),
                0,
            ],
            texcoord: [quantize_half(texcoord[0]), quantize_half(texcoord[1])],
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(
            dequantize_half(self.position[0]),
            dequantize_half(self.position[1]),
            dequantize_half(self.position[2]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_survive_quantization() {
        let v = Vertex::new([0.25, -3.5, 12.0], [0.0, 1.0, 0.0], [0.5, 0.75]);
        assert_eq!(v.position(), Vec3::new(0.25, -3.5, 12.0));
        assert_eq!(v.normal, [128, 255, 128, 0]);
        assert_eq!(v.texcoord.map(dequantize_half), [0.5, 0.75]);
    }

    #[test]
    fn nearby_positions_collapse_after_quantization() {
        // 1.0 + 2^-13 is below half precision at 1.0
        let a = Vertex::new([1.0, 0.0, 0.0], [0.0; 3], [0.0; 2]);
        let b = Vertex::new([1.0 + 1.0 / 8192.0, 0.0, 0.0], [0.0; 3], [0.0; 2]);
        assert_eq!(a, b);
    }
}

//! Marker-based feature extraction for simulated images.

use frame::{DepthImage, Descriptor, FeatureExtractor, Features, Keypoint, KeypointKind, RgbImage};

/// Deterministic 256-bit descriptor for a landmark id. Stable across frames
/// so matching behaves like ideal ORB.
pub fn synthetic_descriptor(id: u32) -> Descriptor {
    let mut bytes = [0u8; 32];
    let mut state = (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(0xD1B5_4A32_D192_ED03);
    for b in bytes.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *b = (state & 0xFF) as u8;
    }
    Descriptor::Binary(bytes)
}

/// Detects the marker pixels written by the sim renderer (blue == 255) and
/// emits one keypoint per marker with its synthetic descriptor.
#[derive(Debug, Default, Clone)]
pub struct MarkerExtractor;

impl FeatureExtractor for MarkerExtractor {
    fn extract(&self, rgb: &RgbImage, _depth: &DepthImage) -> Features {
        let mut features = Features::default();
        for v in 0..rgb.height {
            for u in 0..rgb.width {
                let px = rgb.pixel(u, v);
                if px[2] != 255 {
                    continue;
                }
                let id = px[0] as u32 | ((px[1] as u32) << 8);
                features.keypoints.push(Keypoint {
                    u: u as f32,
                    v: v as f32,
                    response: 1.0,
                });
                features.descriptors.push(synthetic_descriptor(id));
            }
        }
        features
    }

    fn kind(&self) -> KeypointKind {
        KeypointKind::Orb
    }
}

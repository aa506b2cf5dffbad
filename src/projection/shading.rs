//! Per-fragment lighting for the scene backend.
//!
//! Mirrors a standard physically based material: Lambert diffuse, GGX
//! specular for the directional light, hemisphere and ambient fill, then ACES
//! filmic tone mapping and sRGB encoding.

use glam::{Mat3, Vec3};
use palette::{LinSrgb, Srgb};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::sync::OnceLock;

const MIN_ROUGHNESS: f32 = 0.0525;
const DIELECTRIC_F0: f32 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbientLight {
    pub color: Vec3,
    pub intensity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HemisphereLight {
    pub sky_color: Vec3,
    pub ground_color: Vec3,
    pub intensity: f32,
    pub position: Vec3,
}

/// Shines from `position` towards the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionalLight {
    pub color: Vec3,
    pub intensity: f32,
    pub position: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lights {
    pub ambient: AmbientLight,
    pub hemisphere: HemisphereLight,
    pub directional: DirectionalLight,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    /// Linear multiplier on the texture colour.
    pub color: Vec3,
    pub roughness: f32,
    pub metalness: f32,
    pub double_sided: bool,
}

/// Decodes an 8-bit hex-style colour into linear RGB.
pub fn linear_from_hex(rgb: u32) -> Vec3 {
    let lut = srgb_lut();
    Vec3::new(
        lut[((rgb >> 16) & 0xff) as usize],
        lut[((rgb >> 8) & 0xff) as usize],
        lut[(rgb & 0xff) as usize],
    )
}

static SRGB_TO_LINEAR: OnceLock<[f32; 256]> = OnceLock::new();

fn srgb_lut() -> &'static [f32; 256] {
    SRGB_TO_LINEAR.get_or_init(|| {
        let mut lut = [0.0f32; 256];
        for (i, v) in lut.iter_mut().enumerate() {
            let lin: LinSrgb<f32> = Srgb::new(i as u8, 0, 0).into_format::<f32>().into_linear();
            *v = lin.red;
        }
        lut
    })
}

pub fn srgb_to_linear(px: [u8; 4]) -> Vec3 {
    let lut = srgb_lut();
    Vec3::new(lut[px[0] as usize], lut[px[1] as usize], lut[px[2] as usize])
}

pub fn linear_to_srgb(color: Vec3) -> [u8; 3] {
    let c = color.clamp(Vec3::ZERO, Vec3::ONE);
    let encoded: Srgb<u8> = Srgb::from_linear(LinSrgb::new(c.x, c.y, c.z));
    [encoded.red, encoded.green, encoded.blue]
}

/// Outgoing linear radiance at a surface point.
///
/// `normal` and `view` are unit vectors; `view` points from the surface to
/// the camera.
pub fn shade(texel: Vec3, normal: Vec3, view: Vec3, material: &Material, lights: &Lights) -> Vec3 {
    let mut n = normal;
    if material.double_sided && n.dot(view) < 0.0 {
        n = -n;
    }

    let base = texel * material.color;
    let metalness = material.metalness.clamp(0.0, 1.0);
    let diffuse_color = base * (1.0 - metalness);
    let f0 = Vec3::splat(DIELECTRIC_F0).lerp(base, metalness);
    let roughness = material.roughness.clamp(MIN_ROUGHNESS, 1.0);
    let lambert = diffuse_color / PI;

    let mut radiance = Vec3::ZERO;

    let ambient = lights.ambient.color * lights.ambient.intensity;
    radiance += ambient * lambert;

    let up = lights.hemisphere.position.normalize_or_zero();
    let weight = 0.5 * n.dot(up) + 0.5;
    let hemi = lights
        .hemisphere
        .ground_color
        .lerp(lights.hemisphere.sky_color, weight)
        * lights.hemisphere.intensity;
    radiance += hemi * lambert;

    let dir = &lights.directional;
    if dir.intensity > 0.0 {
        let l = dir.position.normalize_or_zero();
        let dot_nl = n.dot(l).clamp(0.0, 1.0);
        if dot_nl > 0.0 {
            let irradiance = dir.color * dir.intensity * dot_nl;
            radiance += irradiance * lambert;
            radiance += irradiance * brdf_ggx(l, view, n, f0, roughness);
        }
    }

    radiance
}

fn brdf_ggx(l: Vec3, v: Vec3, n: Vec3, f0: Vec3, roughness: f32) -> Vec3 {
    let alpha = roughness * roughness;
    let h = (l + v).normalize_or_zero();

    let dot_nl = n.dot(l).clamp(0.0, 1.0);
    let dot_nv = n.dot(v).clamp(0.0, 1.0);
    let dot_nh = n.dot(h).clamp(0.0, 1.0);
    let dot_vh = v.dot(h).clamp(0.0, 1.0);

    let fresnel = (-5.55473 * dot_vh - 6.98316) * dot_vh;
    let f = f0 * (1.0 - fresnel.exp2()) + Vec3::ONE * fresnel.exp2();

    let a2 = alpha * alpha;
    let gv = dot_nl * (a2 + (1.0 - a2) * dot_nv * dot_nv).sqrt();
    let gl = dot_nv * (a2 + (1.0 - a2) * dot_nl * dot_nl).sqrt();
    let vis = 0.5 / (gv + gl).max(1e-6);

    let denom = dot_nh * dot_nh * (a2 - 1.0) + 1.0;
    let d = a2 / (PI * denom * denom);

    f * (vis * d)
}

fn aces_input() -> Mat3 {
    Mat3::from_cols_array(&[
        0.59719, 0.07600, 0.02840, //
        0.35458, 0.90834, 0.13383, //
        0.04823, 0.01566, 0.83777,
    ])
}

fn aces_output() -> Mat3 {
    Mat3::from_cols_array(&[
        1.60475, -0.10208, -0.00327, //
        -0.53108, 1.10813, -0.07276, //
        -0.07367, -0.00605, 1.07602,
    ])
}

fn rrt_and_odt_fit(v: Vec3) -> Vec3 {
    let a = v * (v + 0.0245786) - 0.000090537;
    let b = v * (0.983729 * v + 0.4329510) + 0.238081;
    a / b
}

/// ACES filmic curve with exposure, output clamped to [0, 1].
pub fn aces_filmic(color: Vec3, exposure: f32) -> Vec3 {
    let c = color * (exposure / 0.6);
    let c = aces_input() * c;
    let c = rrt_and_odt_fit(c);
    (aces_output() * c).clamp(Vec3::ZERO, Vec3::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lights(directional: f32) -> Lights {
        Lights {
            ambient: AmbientLight {
                color: Vec3::ONE,
                intensity: 0.4,
            },
            hemisphere: HemisphereLight {
                sky_color: Vec3::ONE,
                ground_color: linear_from_hex(0x444444),
                intensity: 0.7,
                position: Vec3::new(0.0, 200.0, 0.0),
            },
            directional: DirectionalLight {
                color: Vec3::ONE,
                intensity: directional,
                position: Vec3::new(300.0, 600.0, 300.0),
            },
        }
    }

    fn material(roughness: f32, metalness: f32) -> Material {
        Material {
            color: Vec3::ONE,
            roughness,
            metalness,
            double_sided: true,
        }
    }

    #[test]
    fn srgb_conversion_round_trips() {
        assert_eq!(srgb_to_linear([0, 0, 0, 255]), Vec3::ZERO);
        assert!((srgb_to_linear([255, 255, 255, 255]) - Vec3::ONE).abs().max_element() < 1e-6);
        let back = linear_to_srgb(srgb_to_linear([12, 128, 250, 255]));
        for (got, want) in back.iter().zip([12u8, 128, 250]) {
            assert!(got.abs_diff(want) <= 1, "{got} vs {want}");
        }
    }

    #[test]
    fn aces_is_monotonic_and_bounded() {
        assert!(aces_filmic(Vec3::ZERO, 1.0).max_element() < 1e-3);
        let mut prev = 0.0;
        for i in 1..20 {
            let v = aces_filmic(Vec3::splat(i as f32 * 0.25), 1.0).x;
            assert!(v >= prev);
            assert!(v <= 1.0);
            prev = v;
        }
    }

    #[test]
    fn upward_normal_without_direct_light_is_pure_fill() {
        let n = Vec3::Y;
        let v = Vec3::new(0.0, 1.0, 1.0).normalize();
        let out = shade(Vec3::ONE, n, v, &material(1.0, 0.0), &lights(0.0));
        let expected = (0.4 + 0.7) / PI;
        assert!((out - Vec3::splat(expected)).abs().max_element() < 1e-5);
    }

    #[test]
    fn glossy_surface_picks_up_a_highlight() {
        let n = Vec3::Y;
        // mirror direction of the light about the normal
        let l = Vec3::new(300.0, 600.0, 300.0).normalize();
        let v = Vec3::new(-l.x, l.y, -l.z);
        let matte = shade(Vec3::splat(0.5), n, v, &material(1.0, 0.0), &lights(1.4));
        let glossy = shade(Vec3::splat(0.5), n, v, &material(0.35, 0.05), &lights(1.4));
        assert!(glossy.x > matte.x);
    }

    #[test]
    fn back_faces_are_lit_when_double_sided() {
        let v = Vec3::Y;
        let front = shade(Vec3::ONE, Vec3::Y, v, &material(1.0, 0.0), &lights(1.0));
        let back = shade(Vec3::ONE, -Vec3::Y, v, &material(1.0, 0.0), &lights(1.0));
        assert!((front - back).abs().max_element() < 1e-6);
    }
}

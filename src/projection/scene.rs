//! Off-screen 3D scene: one camera, one textured ground plane, three lights.
//!
//! Rendering ray-casts every output pixel against the plane. GPU-side objects
//! (geometry, material, uploaded texture) live in a slot arena owned by the
//! scene; replacing one inserts the new object before removing the old one, so
//! the arena never holds more than one of each.

use super::shading::{
    aces_filmic, linear_from_hex, linear_to_srgb, shade, srgb_to_linear, AmbientLight,
    DirectionalLight, HemisphereLight, Lights, Material,
};
use super::{empty_canvas, Projector};
use crate::catalog::SizeDescriptor;
use crate::error::PipelineError;
use crate::tiling::Texture;
use glam::{Mat4, Quat, Vec2, Vec3};
use image::RgbaImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::time::Instant;

slotmap::new_key_type! {
    /// Handle to an object held by a [`Scene`].
    pub struct ResourceKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CameraProjection {
    #[serde(rename_all = "camelCase")]
    Perspective {
        fov_y_degrees: f32,
        near: f32,
        far: f32,
    },
    /// `view_height` world units fill the canvas height at zoom 1.
    #[serde(rename_all = "camelCase")]
    Orthographic {
        view_height: f32,
        zoom: f32,
        near: f32,
        far: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub projection: CameraProjection,
    pub position: Vec3,
    pub target: Vec3,
    #[serde(default = "default_up")]
    pub up: Vec3,
}

fn default_up() -> Vec3 {
    Vec3::Y
}

impl Camera {
    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        let projection = match self.projection {
            CameraProjection::Perspective {
                fov_y_degrees,
                near,
                far,
            } => Mat4::perspective_rh_gl(fov_y_degrees.to_radians(), aspect, near, far),
            CameraProjection::Orthographic {
                view_height,
                zoom,
                near,
                far,
            } => {
                let half_h = view_height / 2.0 / zoom.max(f32::EPSILON);
                let half_w = half_h * aspect;
                Mat4::orthographic_rh_gl(-half_w, half_w, -half_h, half_h, near, far)
            }
        };
        projection * Mat4::look_at_rh(self.position, self.target, self.up)
    }
}

/// Ground plane in its local XY plane, facing +Z before rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneMesh {
    pub width: f32,
    pub height: f32,
    /// Euler angles in degrees, applied X then Y then Z.
    pub rotation_degrees: Vec3,
    pub position: Vec3,
    /// Texture repeats across the plane.
    pub uv_repeat: Vec2,
}

impl PlaneMesh {
    pub fn rotation(&self) -> Quat {
        let r = self.rotation_degrees;
        Quat::from_rotation_x(r.x.to_radians())
            * Quat::from_rotation_y(r.y.to_radians())
            * Quat::from_rotation_z(r.z.to_radians())
    }

    pub fn model(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation(), self.position)
    }

    /// One texture repeat per `tile_world_size` units.
    pub fn repeat_for_tile_size(width: f32, height: f32, tile_world_size: f32) -> Vec2 {
        Vec2::new(width, height) / tile_world_size.max(f32::EPSILON)
    }

    /// Uniform repeat from a texture scale factor (`1 / scale`).
    pub fn repeat_for_scale(scale: f32) -> Vec2 {
        Vec2::splat(1.0 / scale.max(f32::EPSILON))
    }

    /// Repeat for a physical tile size, given how many world units make one
    /// centimetre. The texture spans `tiles_per_texture` tiles per axis.
    pub fn repeat_for_size(
        &self,
        size: &SizeDescriptor,
        units_per_cm: f32,
        tiles_per_texture: u32,
    ) -> Vec2 {
        let per_texture = tiles_per_texture.max(1) as f32 * units_per_cm;
        Vec2::new(
            self.width / (size.width_cm * per_texture).max(f32::EPSILON),
            self.height / (size.height_cm * per_texture).max(f32::EPSILON),
        )
    }
}

/// User-facing image controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LightingControls {
    pub exposure: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub gamma: f32,
    pub no_reflections: bool,
}

impl Default for LightingControls {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            brightness: 1.0,
            contrast: 1.0,
            saturation: 1.0,
            gamma: 1.0,
            no_reflections: false,
        }
    }
}

/// Per-room light placement and base intensities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightRig {
    pub ambient_base: f32,
    pub hemisphere_base: f32,
    pub directional_base: f32,
    pub hemisphere_position: Vec3,
    pub directional_position: Vec3,
    pub roughness: f32,
    pub metalness: f32,
}

impl LightRig {
    pub fn kitchen() -> Self {
        Self {
            ambient_base: 0.4,
            hemisphere_base: 0.7,
            directional_base: 1.4,
            hemisphere_position: Vec3::new(0.0, 200.0, 0.0),
            directional_position: Vec3::new(300.0, 600.0, 300.0),
            roughness: 0.35,
            metalness: 0.05,
        }
    }

    pub fn living_room() -> Self {
        Self {
            ambient_base: 0.45,
            hemisphere_base: 0.7,
            directional_base: 1.2,
            hemisphere_position: Vec3::new(0.0, 200.0, 0.0),
            directional_position: Vec3::new(300.0, 800.0, 300.0),
            roughness: 0.4,
            metalness: 0.05,
        }
    }

    pub fn lights(&self, controls: &LightingControls) -> Lights {
        let directional = if controls.no_reflections {
            0.0
        } else {
            self.directional_base * controls.brightness * controls.contrast
        };
        Lights {
            ambient: AmbientLight {
                color: Vec3::ONE,
                intensity: self.ambient_base * controls.brightness,
            },
            hemisphere: HemisphereLight {
                sky_color: Vec3::ONE,
                ground_color: linear_from_hex(0x444444),
                intensity: self.hemisphere_base * controls.brightness,
                position: self.hemisphere_position,
            },
            directional: DirectionalLight {
                color: Vec3::ONE,
                intensity: directional,
                position: self.directional_position,
            },
        }
    }

    pub fn material(&self, controls: &LightingControls) -> Material {
        let (roughness, metalness) = if controls.no_reflections {
            (1.0, 0.0)
        } else {
            (self.roughness, self.metalness)
        };
        Material {
            color: Vec3::splat(controls.saturation),
            roughness,
            metalness,
            double_sided: true,
        }
    }
}

fn default_clear_color() -> [u8; 3] {
    [255, 255, 255]
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    pub camera: Camera,
    pub plane: PlaneMesh,
    pub rig: LightRig,
    #[serde(default)]
    pub lighting: LightingControls,
    #[serde(default = "default_clear_color")]
    pub clear_color: [u8; 3],
}

impl SceneConfig {
    /// Perspective kitchen calibration.
    pub fn kitchen() -> Self {
        let tile_scale = 0.09;
        Self {
            camera: Camera {
                projection: CameraProjection::Perspective {
                    fov_y_degrees: 45.0,
                    near: 0.1,
                    far: 2000.0,
                },
                position: Vec3::new(123.0, 437.0, 379.0),
                target: Vec3::ZERO,
                up: Vec3::Y,
            },
            plane: PlaneMesh {
                width: 1800.0,
                height: 1100.0,
                rotation_degrees: Vec3::new(-91.0, -3.0, -27.0),
                position: Vec3::new(40.0, 0.0, 126.0),
                uv_repeat: PlaneMesh::repeat_for_scale(tile_scale),
            },
            rig: LightRig::kitchen(),
            lighting: LightingControls {
                exposure: 1.2,
                ..LightingControls::default()
            },
            clear_color: default_clear_color(),
        }
    }

    /// Top-down orthographic living-room calibration.
    pub fn living_room() -> Self {
        let (width, height) = (2200.0, 830.0);
        Self {
            camera: Camera {
                projection: CameraProjection::Orthographic {
                    view_height: 1400.0,
                    zoom: 2.4,
                    near: 0.1,
                    far: 5000.0,
                },
                position: Vec3::new(0.0, 1000.0, 200.0),
                target: Vec3::new(0.0, 0.0, 200.0),
                up: Vec3::new(0.0, 0.0, -1.0),
            },
            plane: PlaneMesh {
                width,
                height,
                rotation_degrees: Vec3::new(-90.0, 0.0, 0.0),
                position: Vec3::new(0.0, 0.0, 100.0),
                uv_repeat: PlaneMesh::repeat_for_tile_size(width, height, 200.0),
            },
            rig: LightRig::living_room(),
            lighting: LightingControls {
                exposure: 1.1,
                ..LightingControls::default()
            },
            clear_color: default_clear_color(),
        }
    }
}

/// Texture uploaded as linear RGB.
#[derive(Debug)]
struct UploadedTexture {
    width: u32,
    height: u32,
    texels: Vec<Vec3>,
}

impl UploadedTexture {
    fn upload(image: &RgbaImage) -> Self {
        let texels = image
            .as_raw()
            .par_chunks_exact(4)
            .map(|p| srgb_to_linear([p[0], p[1], p[2], p[3]]))
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            texels,
        }
    }

    fn texel(&self, x: i64, y: i64) -> Vec3 {
        let x = x.rem_euclid(self.width as i64) as usize;
        let y = y.rem_euclid(self.height as i64) as usize;
        self.texels[y * self.width as usize + x]
    }

    /// Bilinear lookup with repeat wrapping; `v` grows upwards.
    fn sample(&self, uv: Vec2) -> Vec3 {
        let u = uv.x - uv.x.floor();
        let v = uv.y - uv.y.floor();
        let fx = u * self.width as f32 - 0.5;
        let fy = (1.0 - v) * self.height as f32 - 0.5;
        let (x0, y0) = (fx.floor(), fy.floor());
        let (tx, ty) = (fx - x0, fy - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);

        let top = self.texel(x0, y0).lerp(self.texel(x0 + 1, y0), tx);
        let bottom = self.texel(x0, y0 + 1).lerp(self.texel(x0 + 1, y0 + 1), tx);
        top.lerp(bottom, ty)
    }
}

#[derive(Debug)]
enum GpuResource {
    Geometry(PlaneMesh),
    Material(Material),
    Texture(UploadedTexture),
}

#[derive(Debug, Clone, Copy, Default)]
struct MeshSlots {
    geometry: Option<ResourceKey>,
    material: Option<ResourceKey>,
    texture: Option<ResourceKey>,
}

pub struct Scene {
    config: SceneConfig,
    resources: SlotMap<ResourceKey, GpuResource>,
    mesh: MeshSlots,
}

impl Scene {
    pub fn new(config: SceneConfig) -> Self {
        let mut scene = Self {
            config,
            resources: SlotMap::with_key(),
            mesh: MeshSlots::default(),
        };
        scene.sync_geometry();
        scene.sync_material();
        scene
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Objects currently held by the scene.
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn has_texture(&self) -> bool {
        self.mesh.texture.is_some()
    }

    fn replace(&mut self, slot: Option<ResourceKey>, resource: GpuResource) -> ResourceKey {
        let key = self.resources.insert(resource);
        if let Some(old) = slot {
            self.resources.remove(old);
        }
        key
    }

    fn sync_geometry(&mut self) {
        let key = self.replace(self.mesh.geometry, GpuResource::Geometry(self.config.plane));
        self.mesh.geometry = Some(key);
    }

    fn sync_material(&mut self) {
        let material = self.config.rig.material(&self.config.lighting);
        let key = self.replace(self.mesh.material, GpuResource::Material(material));
        self.mesh.material = Some(key);
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.config.camera = camera;
    }

    pub fn set_plane(&mut self, plane: PlaneMesh) {
        self.config.plane = plane;
        self.sync_geometry();
    }

    pub fn set_lighting(&mut self, lighting: LightingControls) {
        self.config.lighting = lighting;
        self.sync_material();
    }

    /// Uploads `texture` as the plane's surface map, releasing the previous one.
    pub fn attach_texture(&mut self, texture: &Texture) -> ResourceKey {
        let uploaded = UploadedTexture::upload(&texture.image);
        let key = self.replace(self.mesh.texture, GpuResource::Texture(uploaded));
        self.mesh.texture = Some(key);
        key
    }

    /// Drops the uploaded texture, keeping geometry and material.
    pub fn detach_texture(&mut self) {
        if let Some(key) = self.mesh.texture.take() {
            self.resources.remove(key);
        }
    }

    /// Releases every object the scene holds.
    pub fn detach(&mut self) {
        let released = self.resources.len();
        self.resources.clear();
        self.mesh = MeshSlots::default();
        if released > 0 {
            log::debug!("Scene released {} resources", released);
        }
    }

    fn lookup(&self) -> Result<(&PlaneMesh, &Material, &UploadedTexture), PipelineError> {
        let geometry = self.mesh.geometry.and_then(|k| self.resources.get(k));
        let material = self.mesh.material.and_then(|k| self.resources.get(k));
        let texture = self.mesh.texture.and_then(|k| self.resources.get(k));
        match (geometry, material, texture) {
            (
                Some(GpuResource::Geometry(g)),
                Some(GpuResource::Material(m)),
                Some(GpuResource::Texture(t)),
            ) => Ok((g, m, t)),
            _ => Err(PipelineError::SurfaceUnavailable(
                "scene has no textured plane attached".to_string(),
            )),
        }
    }

    /// Renders the current scene at `width`x`height`.
    pub fn render(&self, width: u32, height: u32) -> Result<RgbaImage, PipelineError> {
        if width == 0 || height == 0 {
            return Ok(empty_canvas(width, height));
        }
        let (plane, material, texture) = self.lookup()?;
        if texture.width == 0 || texture.height == 0 {
            return Ok(empty_canvas(width, height));
        }

        let aspect = width as f32 / height as f32;
        let inv_view_proj = self.config.camera.view_projection(aspect).inverse();
        let model = plane.model();
        let inv_model = model.inverse();
        let normal = plane.rotation() * Vec3::Z;
        let lights = self.config.rig.lights(&self.config.lighting);
        let exposure = self.config.lighting.exposure * self.config.lighting.gamma;
        let clear = self.config.clear_color;
        let (half_w, half_h) = (plane.width / 2.0, plane.height / 2.0);

        let mut out = RgbaImage::new(width, height);
        out.par_chunks_exact_mut(width as usize * 4)
            .enumerate()
            .for_each(|(y, row)| {
                let ndc_y = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let ndc_x = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
                    let near = inv_view_proj.project_point3(Vec3::new(ndc_x, ndc_y, -1.0));
                    let far = inv_view_proj.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
                    let dir = (far - near).normalize_or_zero();

                    let local_origin = inv_model.transform_point3(near);
                    let local_dir = inv_model.transform_vector3(dir);
                    let hit = if local_dir.z.abs() > 1e-8 {
                        let t = -local_origin.z / local_dir.z;
                        let p = local_origin + local_dir * t;
                        (t > 0.0 && p.x.abs() <= half_w && p.y.abs() <= half_h).then_some(p)
                    } else {
                        None
                    };

                    let rgb = match hit {
                        Some(p) => {
                            let uv = Vec2::new(p.x / plane.width + 0.5, p.y / plane.height + 0.5)
                                * plane.uv_repeat;
                            let texel = texture.sample(uv);
                            let radiance = shade(texel, normal, -dir, material, &lights);
                            linear_to_srgb(aces_filmic(radiance, exposure))
                        }
                        None => clear,
                    };
                    px.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
                }
            });
        Ok(out)
    }
}

impl Projector for Scene {
    fn name(&self) -> &'static str {
        "scene"
    }

    fn apply_lighting(&mut self, lighting: &LightingControls) {
        if self.config.lighting != *lighting {
            self.set_lighting(*lighting);
        }
    }

    fn release_texture(&mut self) {
        self.detach_texture();
    }

    fn project(
        &mut self,
        texture: &Texture,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<RgbaImage, PipelineError> {
        if texture.is_empty() || canvas_width == 0 || canvas_height == 0 {
            return Ok(empty_canvas(canvas_width, canvas_height));
        }
        let start = Instant::now();
        if self.mesh.geometry.is_none() {
            self.sync_geometry();
        }
        if self.mesh.material.is_none() {
            self.sync_material();
        }
        self.attach_texture(texture);
        let out = self.render(canvas_width, canvas_height)?;
        log::debug!(
            "Scene render {}x{} ({} live resources) in {}ms",
            canvas_width,
            canvas_height,
            self.live_resources(),
            start.elapsed().as_millis()
        );
        Ok(out)
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        self.detach();
    }
}

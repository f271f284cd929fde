//! Overlay layer descriptors and per-frame composition layer assembly.
//!
//! Collaborators describe overlays with [`LayerDescriptor`]s. Every frame the compositor
//! decides which ones the runtime can show natively and which face-locked ones have to be
//! composited into the single emulated layer, then assembles the submission list:
//! projection, depth, native overlays, emulated overlay.

use crate::config::Capabilities;
use crate::pose::{Fov, Pose};
use crate::runtime::{SpaceHandle, SwapchainHandle, View};
use crate::swapchain::SwapchainView;
use crate::warn_once::{warn_once, WarnOnce};
use glam::f32::{Vec2, Vec3};
use glam::IVec2;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

pub type LayerId = u32;

/// Distance of the emulated face-locked quad from the eyes, in meters.
const EMULATED_LAYER_DISTANCE: f32 = 1.0;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PositionType {
    #[default]
    WorldLocked,
    TrackerLocked,
    FaceLocked,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerShapeKind {
    Quad,
    Cylinder,
    Equirect,
    Equirect2,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LayerShape {
    Quad,
    Cylinder {
        radius: f32,
        central_angle: f32,
        aspect_ratio: f32,
    },
    Equirect {
        radius: f32,
        scale: Vec2,
        bias: Vec2,
    },
    Equirect2 {
        radius: f32,
        central_horizontal_angle: f32,
        upper_vertical_angle: f32,
        lower_vertical_angle: f32,
    },
}

impl LayerShape {
    pub fn kind(&self) -> LayerShapeKind {
        match self {
            Self::Quad => LayerShapeKind::Quad,
            Self::Cylinder { .. } => LayerShapeKind::Cylinder,
            Self::Equirect { .. } => LayerShapeKind::Equirect,
            Self::Equirect2 { .. } => LayerShapeKind::Equirect2,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerFlags {
    pub hidden: bool,
    /// Quad height follows the texture's aspect ratio instead of `size.y`.
    pub preserve_aspect_ratio: bool,
    /// The texture never changes, so a single-image swapchain is enough.
    pub static_texture: bool,
}

/// A collaborator-owned texture the layer is copied from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureRef {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub format: i64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UvRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Default for UvRect {
    fn default() -> Self {
        Self {
            min: Vec2::ZERO,
            max: Vec2::ONE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LayerDescriptor {
    pub priority: i32,
    pub shape: LayerShape,
    /// In world units. Relative to the world, the tracking origin or the face depending on
    /// `position_type`.
    pub transform: Pose,
    /// Quad extents in world units.
    pub size: Vec2,
    pub uv_rect: UvRect,
    /// Right eye texture for stereo layers, both eyes otherwise.
    pub texture: Option<TextureRef>,
    pub left_texture: Option<TextureRef>,
    pub position_type: PositionType,
    pub flags: LayerFlags,
}

impl LayerDescriptor {
    pub fn quad(texture: TextureRef, transform: Pose, size: Vec2) -> Self {
        Self {
            priority: 0,
            shape: LayerShape::Quad,
            transform,
            size,
            uv_rect: UvRect::default(),
            texture: Some(texture),
            left_texture: None,
            position_type: PositionType::WorldLocked,
            flags: LayerFlags::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_position_type(mut self, position_type: PositionType) -> Self {
        self.position_type = position_type;
        self
    }

    pub fn with_shape(mut self, shape: LayerShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn is_face_locked(&self) -> bool {
        self.position_type == PositionType::FaceLocked
    }

    pub fn is_stereo(&self) -> bool {
        self.left_texture.is_some()
    }

    fn is_visible(&self) -> bool {
        !self.flags.hidden && self.texture.is_some()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubImage {
    pub swapchain: SwapchainHandle,
    pub offset: IVec2,
    pub extent: IVec2,
    pub array_index: u32,
}

impl SubImage {
    fn whole(swapchain: &SwapchainView, array_index: u32) -> Self {
        Self {
            swapchain: swapchain.handle,
            offset: IVec2::ZERO,
            extent: IVec2::new(swapchain.width as i32, swapchain.height as i32),
            array_index,
        }
    }

    fn uv(swapchain: &SwapchainView, uv: &UvRect, array_index: u32) -> Self {
        let dims = Vec2::new(swapchain.width as f32, swapchain.height as f32);
        let min = (uv.min.clamp(Vec2::ZERO, Vec2::ONE) * dims).round();
        let max = (uv.max.clamp(Vec2::ZERO, Vec2::ONE) * dims).round();
        Self {
            swapchain: swapchain.handle,
            offset: min.as_ivec2(),
            extent: (max - min).max(Vec2::ZERO).as_ivec2(),
            array_index,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EyeVisibility {
    Both,
    Left,
    Right,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProjectionView {
    pub pose: Pose,
    pub fov: Fov,
    pub sub_image: SubImage,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DepthView {
    pub sub_image: SubImage,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionLayer {
    pub space: SpaceHandle,
    pub views: Vec<ProjectionView>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DepthLayer {
    pub views: Vec<DepthView>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OverlayShape {
    Quad {
        size: Vec2,
    },
    Cylinder {
        radius: f32,
        central_angle: f32,
        aspect_ratio: f32,
    },
    Equirect {
        radius: f32,
        scale: Vec2,
        bias: Vec2,
    },
    Equirect2 {
        radius: f32,
        central_horizontal_angle: f32,
        upper_vertical_angle: f32,
        lower_vertical_angle: f32,
    },
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OverlayLayer {
    /// `None` for the emulated layer.
    pub id: Option<LayerId>,
    pub space: SpaceHandle,
    pub eye: EyeVisibility,
    pub sub_image: SubImage,
    pub pose: Pose,
    pub shape: OverlayShape,
}

/// One entry of the list handed to the runtime at end-frame. Never mutated after assembly.
#[derive(Clone, Debug, PartialEq)]
pub enum CompositionLayer {
    Projection(ProjectionLayer),
    Depth(DepthLayer),
    Overlay(OverlayLayer),
}

impl CompositionLayer {
    pub fn swapchains(&self) -> Vec<SwapchainHandle> {
        let mut handles: Vec<SwapchainHandle> = match self {
            Self::Projection(layer) => layer.views.iter().map(|v| v.sub_image.swapchain).collect(),
            Self::Depth(layer) => layer.views.iter().map(|v| v.sub_image.swapchain).collect(),
            Self::Overlay(layer) => vec![layer.sub_image.swapchain],
        };
        handles.dedup();
        handles
    }

    pub fn overlay_id(&self) -> Option<LayerId> {
        match self {
            Self::Overlay(layer) => layer.id,
            _ => None,
        }
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self, Self::Overlay(OverlayLayer { id: None, .. }))
    }
}

/// Which overlays go to the runtime as is and which get composited into the emulated layer.
#[derive(Clone, Debug, Default)]
pub struct LayerPlan {
    pub native: Vec<(LayerId, LayerDescriptor)>,
    pub emulated: Vec<(LayerId, LayerDescriptor)>,
}

impl LayerPlan {
    pub fn needs_emulation(&self) -> bool {
        !self.emulated.is_empty()
    }
}

pub struct ProjectionInput {
    pub views: Vec<View>,
    /// All views side by side.
    pub color: SwapchainView,
}

pub struct DepthInput {
    pub depth: SwapchainView,
    pub near_z: f32,
    pub far_z: f32,
}

pub struct FrameLayerInput<'a> {
    pub tracking_space: SpaceHandle,
    pub view_space: Option<SpaceHandle>,
    /// Missing when the views couldn't be located this frame.
    pub projection: Option<ProjectionInput>,
    pub depth: Option<DepthInput>,
    pub plan: &'a LayerPlan,
    /// Application world origin in the tracking space.
    pub world_to_tracking: Pose,
    pub world_to_meters: f32,
    pub layer_swapchains: &'a HashMap<LayerId, SwapchainView>,
    pub emulated: Option<SwapchainView>,
}

pub struct LayerCompositor {
    descriptors: RwLock<BTreeMap<LayerId, LayerDescriptor>>,
    next_id: AtomicU32,
    warnings: WarnOnce,
}

impl Default for LayerCompositor {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerCompositor {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            warnings: WarnOnce::default(),
        }
    }

    pub fn create(&self, descriptor: LayerDescriptor) -> LayerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.descriptors.write().unwrap().insert(id, descriptor);
        debug!("Created layer {id} ({:?})", descriptor.shape.kind());
        id
    }

    pub fn update(&self, id: LayerId, descriptor: LayerDescriptor) -> bool {
        match self.descriptors.write().unwrap().get_mut(&id) {
            Some(existing) => {
                *existing = descriptor;
                true
            }
            None => false,
        }
    }

    pub fn destroy(&self, id: LayerId) -> bool {
        let removed = self.descriptors.write().unwrap().remove(&id).is_some();
        if removed {
            debug!("Destroyed layer {id}");
        }
        removed
    }

    pub fn layer(&self, id: LayerId) -> Option<LayerDescriptor> {
        self.descriptors.read().unwrap().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> HashSet<LayerId> {
        self.descriptors.read().unwrap().keys().copied().collect()
    }

    pub fn reset_warnings(&self) {
        self.warnings.reset();
    }

    /// Visible layers in submission order: non-face-locked before face-locked, then by
    /// ascending priority, then by ascending id.
    pub fn sorted_layers(&self) -> Vec<(LayerId, LayerDescriptor)> {
        let mut layers: Vec<_> = self
            .descriptors
            .read()
            .unwrap()
            .iter()
            .filter(|(_, d)| d.is_visible())
            .map(|(id, d)| (*id, *d))
            .collect();
        layers.sort_by_key(|(id, d)| (d.is_face_locked(), d.priority, *id));
        layers
    }

    pub fn plan(&self, capabilities: &Capabilities) -> LayerPlan {
        let layers: Vec<_> = self
            .sorted_layers()
            .into_iter()
            .filter(|(id, d)| {
                let supported = capabilities.supports_shape(d.shape.kind());
                if !supported {
                    warn_once!(
                        self.warnings,
                        "unsupported_shape",
                        "Layer {id} uses unsupported shape {:?}, not showing it",
                        d.shape.kind()
                    );
                }
                supported
            })
            .collect();

        let budget = capabilities.native_overlay_budget();
        let emulate = capabilities.force_layer_emulation || layers.len() > budget;
        if !emulate {
            return LayerPlan {
                native: layers,
                emulated: Vec::new(),
            };
        }

        let (emulated, mut native): (Vec<_>, Vec<_>) =
            layers.into_iter().partition(|(_, d)| d.is_face_locked());
        // The emulated layer takes one of the slots.
        let limit = if emulated.is_empty() {
            budget
        } else {
            budget.saturating_sub(1)
        };
        if native.len() > limit {
            warn_once!(
                self.warnings,
                "layer_budget",
                "Runtime supports {budget} overlay layers, dropping {}",
                native.len() - limit
            );
            native.truncate(limit);
        }
        trace!(
            "Layer plan: {} native, {} emulated",
            native.len(),
            emulated.len()
        );
        LayerPlan { native, emulated }
    }

    /// Assembles this frame's composition layers. Layers whose swapchain or space is missing
    /// are left out.
    pub fn build_frame_layers(&self, input: &FrameLayerInput) -> Vec<CompositionLayer> {
        let mut layers = Vec::new();

        if let Some(projection) = &input.projection {
            layers.push(CompositionLayer::Projection(assemble_projection(
                input.tracking_space,
                projection,
            )));
            if let Some(depth) = &input.depth {
                layers.push(CompositionLayer::Depth(assemble_depth(
                    projection.views.len(),
                    depth,
                )));
            }
        }

        for (id, descriptor) in &input.plan.native {
            let Some(swapchain) = input.layer_swapchains.get(id) else {
                trace!("Layer {id} has no swapchain yet");
                continue;
            };
            let Some((space, pose)) = place_overlay(descriptor, input) else {
                continue;
            };
            let eyes: &[(EyeVisibility, u32)] = if descriptor.is_stereo() {
                &[(EyeVisibility::Left, 0), (EyeVisibility::Right, 1)]
            } else {
                &[(EyeVisibility::Both, 0)]
            };
            for &(eye, array_index) in eyes {
                let sub_image = SubImage::uv(swapchain, &descriptor.uv_rect, array_index);
                let shape = assemble_shape(descriptor, swapchain, input.world_to_meters);
                layers.push(CompositionLayer::Overlay(OverlayLayer {
                    id: Some(*id),
                    space,
                    eye,
                    sub_image,
                    pose,
                    shape,
                }));
            }
        }

        if input.plan.needs_emulation() {
            match (&input.emulated, input.view_space, &input.projection) {
                (Some(swapchain), Some(view_space), Some(projection)) => {
                    layers.push(CompositionLayer::Overlay(assemble_emulated(
                        view_space,
                        swapchain,
                        &projection.views,
                    )));
                }
                _ => warn_once!(
                    self.warnings,
                    "emulated_layer",
                    "Emulated overlay layer unavailable this frame"
                ),
            }
        }

        layers
    }
}

fn assemble_projection(space: SpaceHandle, projection: &ProjectionInput) -> ProjectionLayer {
    let count = projection.views.len().max(1) as u32;
    let view_width = (projection.color.width / count) as i32;
    let height = projection.color.height as i32;
    ProjectionLayer {
        space,
        views: projection
            .views
            .iter()
            .enumerate()
            .map(|(i, view)| ProjectionView {
                pose: view.pose,
                fov: view.fov,
                sub_image: SubImage {
                    swapchain: projection.color.handle,
                    offset: IVec2::new(i as i32 * view_width, 0),
                    extent: IVec2::new(view_width, height),
                    array_index: 0,
                },
            })
            .collect(),
    }
}

fn assemble_depth(view_count: usize, depth: &DepthInput) -> DepthLayer {
    let count = view_count.max(1) as u32;
    let view_width = (depth.depth.width / count) as i32;
    DepthLayer {
        views: (0..view_count)
            .map(|i| DepthView {
                sub_image: SubImage {
                    swapchain: depth.depth.handle,
                    offset: IVec2::new(i as i32 * view_width, 0),
                    extent: IVec2::new(view_width, depth.depth.height as i32),
                    array_index: 0,
                },
                min_depth: 0.0,
                max_depth: 1.0,
                near_z: depth.near_z,
                far_z: depth.far_z,
            })
            .collect(),
    }
}

/// Space and pose (in meters) the overlay is expressed in.
fn place_overlay(
    descriptor: &LayerDescriptor,
    input: &FrameLayerInput,
) -> Option<(SpaceHandle, Pose)> {
    let local = descriptor.transform.scale_position(1.0 / input.world_to_meters);
    match descriptor.position_type {
        PositionType::WorldLocked => Some((input.tracking_space, input.world_to_tracking * local)),
        PositionType::TrackerLocked => Some((input.tracking_space, local)),
        PositionType::FaceLocked => input.view_space.map(|space| (space, local)),
    }
}

fn assemble_quad(
    descriptor: &LayerDescriptor,
    swapchain: &SwapchainView,
    world_to_meters: f32,
) -> OverlayShape {
    let mut size = descriptor.size / world_to_meters;
    if descriptor.flags.preserve_aspect_ratio {
        // Tracks the current texture every frame.
        size.y = size.x / swapchain.aspect_ratio();
    }
    OverlayShape::Quad { size }
}

fn assemble_cylinder(
    radius: f32,
    central_angle: f32,
    aspect_ratio: f32,
    world_to_meters: f32,
) -> OverlayShape {
    OverlayShape::Cylinder {
        radius: radius / world_to_meters,
        central_angle,
        aspect_ratio,
    }
}

fn assemble_equirect(radius: f32, scale: Vec2, bias: Vec2, world_to_meters: f32) -> OverlayShape {
    OverlayShape::Equirect {
        radius: radius / world_to_meters,
        scale,
        bias,
    }
}

fn assemble_equirect2(
    radius: f32,
    central_horizontal_angle: f32,
    upper_vertical_angle: f32,
    lower_vertical_angle: f32,
    world_to_meters: f32,
) -> OverlayShape {
    OverlayShape::Equirect2 {
        radius: radius / world_to_meters,
        central_horizontal_angle,
        upper_vertical_angle,
        lower_vertical_angle,
    }
}

fn assemble_shape(
    descriptor: &LayerDescriptor,
    swapchain: &SwapchainView,
    world_to_meters: f32,
) -> OverlayShape {
    match descriptor.shape {
        LayerShape::Quad => assemble_quad(descriptor, swapchain, world_to_meters),
        LayerShape::Cylinder {
            radius,
            central_angle,
            aspect_ratio,
        } => assemble_cylinder(radius, central_angle, aspect_ratio, world_to_meters),
        LayerShape::Equirect { radius, scale, bias } => {
            assemble_equirect(radius, scale, bias, world_to_meters)
        }
        LayerShape::Equirect2 {
            radius,
            central_horizontal_angle,
            upper_vertical_angle,
            lower_vertical_angle,
        } => assemble_equirect2(
            radius,
            central_horizontal_angle,
            upper_vertical_angle,
            lower_vertical_angle,
            world_to_meters,
        ),
    }
}

/// Union of the per-view fields of view.
fn combined_fov(views: &[View]) -> Fov {
    views.iter().skip(1).fold(
        views.first().map(|v| v.fov).unwrap_or_default(),
        |acc, v| Fov {
            angle_left: acc.angle_left.min(v.fov.angle_left),
            angle_right: acc.angle_right.max(v.fov.angle_right),
            angle_up: acc.angle_up.max(v.fov.angle_up),
            angle_down: acc.angle_down.min(v.fov.angle_down),
        },
    )
}

/// A view-space quad that covers the combined field of view at a fixed distance.
fn assemble_emulated(
    view_space: SpaceHandle,
    swapchain: &SwapchainView,
    views: &[View],
) -> OverlayLayer {
    let fov = combined_fov(views);
    let d = EMULATED_LAYER_DISTANCE;
    let (left, right) = (fov.angle_left.tan() * d, fov.angle_right.tan() * d);
    let (down, up) = (fov.angle_down.tan() * d, fov.angle_up.tan() * d);
    let center = Vec3::new((left + right) / 2.0, (down + up) / 2.0, -d);

    OverlayLayer {
        id: None,
        space: view_space,
        eye: EyeVisibility::Both,
        sub_image: SubImage::whole(swapchain, 0),
        pose: Pose::from_position(center),
        shape: OverlayShape::Quad {
            size: Vec2::new(right - left, up - down),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACKING: SpaceHandle = SpaceHandle(100);
    const VIEW: SpaceHandle = SpaceHandle(101);

    fn texture() -> TextureRef {
        TextureRef {
            id: 7,
            width: 512,
            height: 256,
            format: 43,
        }
    }

    fn swapchain(handle: u64, width: u32, height: u32) -> SwapchainView {
        SwapchainView {
            handle: SwapchainHandle(handle),
            width,
            height,
            array_size: 1,
        }
    }

    fn caps(max_layer_count: u32) -> Capabilities {
        Capabilities {
            cylinder_layer: true,
            max_layer_count,
            ..Capabilities::default()
        }
    }

    fn views() -> Vec<View> {
        vec![
            View {
                pose: Pose::from_position(Vec3::new(-0.03, 0.0, 0.0)),
                fov: Fov::symmetric(1.6, 1.6),
            },
            View {
                pose: Pose::from_position(Vec3::new(0.03, 0.0, 0.0)),
                fov: Fov::symmetric(1.6, 1.6),
            },
        ]
    }

    fn build(
        compositor: &LayerCompositor,
        plan: &LayerPlan,
        swapchains: &HashMap<LayerId, SwapchainView>,
        world_to_meters: f32,
    ) -> Vec<CompositionLayer> {
        compositor.build_frame_layers(&FrameLayerInput {
            tracking_space: TRACKING,
            view_space: Some(VIEW),
            projection: Some(ProjectionInput {
                views: views(),
                color: swapchain(1, 2880, 1600),
            }),
            depth: None,
            plan,
            world_to_tracking: Pose::IDENTITY,
            world_to_meters,
            layer_swapchains: swapchains,
            emulated: Some(swapchain(2, 1024, 1024)),
        })
    }

    fn quad(priority: i32, position_type: PositionType) -> LayerDescriptor {
        LayerDescriptor::quad(texture(), Pose::IDENTITY, Vec2::ONE)
            .with_priority(priority)
            .with_position_type(position_type)
    }

    #[test]
    fn face_locked_layers_sort_last() {
        let compositor = LayerCompositor::new();
        let world5 = compositor.create(quad(5, PositionType::WorldLocked));
        let world1 = compositor.create(quad(1, PositionType::WorldLocked));
        let face0 = compositor.create(quad(0, PositionType::FaceLocked));

        let order: Vec<_> = compositor.sorted_layers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, [world1, world5, face0]);

        let plan = compositor.plan(&caps(16));
        let swapchains: HashMap<_, _> = [world5, world1, face0]
            .into_iter()
            .map(|id| (id, swapchain(10 + id as u64, 512, 256)))
            .collect();
        let layers = build(&compositor, &plan, &swapchains, 1.0);
        let overlay_ids: Vec<_> = layers.iter().filter_map(CompositionLayer::overlay_id).collect();
        assert!(matches!(layers[0], CompositionLayer::Projection(_)));
        assert_eq!(overlay_ids, [world1, world5, face0]);
    }

    #[test]
    fn equal_priority_sorts_by_id() {
        let compositor = LayerCompositor::new();
        let a = compositor.create(quad(3, PositionType::TrackerLocked));
        let b = compositor.create(quad(3, PositionType::WorldLocked));
        let order: Vec<_> = compositor.sorted_layers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, [a, b]);
    }

    #[test]
    fn hidden_and_textureless_layers_are_skipped() {
        let compositor = LayerCompositor::new();
        let mut hidden = quad(0, PositionType::WorldLocked);
        hidden.flags.hidden = true;
        compositor.create(hidden);
        let mut empty = quad(0, PositionType::WorldLocked);
        empty.texture = None;
        compositor.create(empty);
        assert!(compositor.sorted_layers().is_empty());
        assert_eq!(compositor.len(), 2);
    }

    #[test]
    fn unsupported_shapes_are_dropped() {
        let compositor = LayerCompositor::new();
        let cylinder = compositor.create(quad(0, PositionType::WorldLocked).with_shape(
            LayerShape::Cylinder {
                radius: 2.0,
                central_angle: 1.0,
                aspect_ratio: 2.0,
            },
        ));
        compositor.create(quad(0, PositionType::WorldLocked).with_shape(LayerShape::Equirect {
            radius: 5.0,
            scale: Vec2::ONE,
            bias: Vec2::ZERO,
        }));
        let plan = compositor.plan(&caps(16));
        assert_eq!(plan.native.len(), 1);
        assert_eq!(plan.native[0].0, cylinder);
    }

    #[test]
    fn over_budget_emulates_face_locked() {
        let compositor = LayerCompositor::new();
        let world = compositor.create(quad(0, PositionType::WorldLocked));
        let world2 = compositor.create(quad(1, PositionType::WorldLocked));
        let hud = compositor.create(quad(0, PositionType::FaceLocked));
        let hud2 = compositor.create(quad(1, PositionType::FaceLocked));

        // Projection plus three overlays.
        let plan = compositor.plan(&caps(4));
        let native: Vec<_> = plan.native.iter().map(|(id, _)| *id).collect();
        let emulated: Vec<_> = plan.emulated.iter().map(|(id, _)| *id).collect();
        assert_eq!(native, [world, world2]);
        assert_eq!(emulated, [hud, hud2]);

        let swapchains: HashMap<_, _> =
            [(world, swapchain(20, 64, 64)), (world2, swapchain(21, 64, 64))].into();
        let layers = build(&compositor, &plan, &swapchains, 1.0);
        assert_eq!(layers.len(), 4);
        let CompositionLayer::Overlay(emulated) = layers.last().unwrap() else {
            panic!("expected an overlay");
        };
        assert!(emulated.id.is_none());
        assert_eq!(emulated.space, VIEW);
        let OverlayShape::Quad { size } = emulated.shape else {
            panic!("emulated layer should be a quad");
        };
        let expected = 2.0 * 0.8f32.tan();
        assert!((size.x - expected).abs() < 1e-4 && (size.y - expected).abs() < 1e-4);
    }

    #[test]
    fn forced_emulation_reserves_a_slot() {
        let compositor = LayerCompositor::new();
        compositor.create(quad(0, PositionType::WorldLocked));
        compositor.create(quad(1, PositionType::WorldLocked));
        compositor.create(quad(0, PositionType::FaceLocked));
        let capabilities = Capabilities {
            force_layer_emulation: true,
            ..caps(3)
        };
        let plan = compositor.plan(&capabilities);
        assert_eq!(plan.native.len(), 1);
        assert_eq!(plan.emulated.len(), 1);
    }

    #[test]
    fn preserve_aspect_ratio_follows_swapchain() {
        let mut descriptor = quad(0, PositionType::WorldLocked);
        descriptor.size = Vec2::new(200.0, 50.0);
        assert_eq!(
            assemble_quad(&descriptor, &swapchain(1, 100, 100), 100.0),
            OverlayShape::Quad {
                size: Vec2::new(2.0, 0.5)
            }
        );

        descriptor.flags.preserve_aspect_ratio = true;
        assert_eq!(
            assemble_quad(&descriptor, &swapchain(1, 100, 100), 100.0),
            OverlayShape::Quad {
                size: Vec2::new(2.0, 2.0)
            }
        );
        assert_eq!(
            assemble_quad(&descriptor, &swapchain(1, 400, 100), 100.0),
            OverlayShape::Quad {
                size: Vec2::new(2.0, 0.5)
            }
        );
    }

    #[test]
    fn stereo_layers_submit_per_eye() {
        let compositor = LayerCompositor::new();
        let mut descriptor = quad(0, PositionType::TrackerLocked);
        descriptor.left_texture = Some(texture());
        descriptor.uv_rect = UvRect {
            min: Vec2::new(0.0, 0.5),
            max: Vec2::ONE,
        };
        let id = compositor.create(descriptor);
        let plan = compositor.plan(&caps(16));
        let swapchains = HashMap::from([(id, swapchain(30, 512, 256))]);
        let layers = build(&compositor, &plan, &swapchains, 1.0);

        let overlays: Vec<_> = layers
            .iter()
            .filter_map(|l| match l {
                CompositionLayer::Overlay(o) => Some(*o),
                _ => None,
            })
            .collect();
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays[0].eye, EyeVisibility::Left);
        assert_eq!(overlays[1].eye, EyeVisibility::Right);
        assert_eq!(overlays[1].sub_image.array_index, 1);
        assert_eq!(overlays[0].sub_image.offset, IVec2::new(0, 128));
        assert_eq!(overlays[0].sub_image.extent, IVec2::new(512, 128));
    }

    #[test]
    fn projection_views_split_the_color_swapchain() {
        let compositor = LayerCompositor::new();
        let plan = LayerPlan::default();
        let layers = compositor.build_frame_layers(&FrameLayerInput {
            tracking_space: TRACKING,
            view_space: Some(VIEW),
            projection: Some(ProjectionInput {
                views: views(),
                color: swapchain(1, 2880, 1600),
            }),
            depth: Some(DepthInput {
                depth: swapchain(3, 2880, 1600),
                near_z: 0.1,
                far_z: 100.0,
            }),
            plan: &plan,
            world_to_tracking: Pose::IDENTITY,
            world_to_meters: 1.0,
            layer_swapchains: &HashMap::new(),
            emulated: None,
        });

        let CompositionLayer::Projection(projection) = &layers[0] else {
            panic!("expected projection first");
        };
        assert_eq!(projection.space, TRACKING);
        assert_eq!(projection.views[1].sub_image.offset, IVec2::new(1440, 0));
        assert_eq!(projection.views[1].sub_image.extent, IVec2::new(1440, 1600));
        let CompositionLayer::Depth(depth) = &layers[1] else {
            panic!("expected depth second");
        };
        assert_eq!(depth.views.len(), 2);
        assert_eq!(layers[1].swapchains(), [SwapchainHandle(3)]);
    }

    #[test]
    fn world_locked_layers_follow_world_origin() {
        let compositor = LayerCompositor::new();
        let id = compositor.create(LayerDescriptor::quad(
            texture(),
            Pose::from_position(Vec3::new(0.0, 0.0, -200.0)),
            Vec2::ONE,
        ));
        let plan = compositor.plan(&caps(16));
        let swapchains = HashMap::from([(id, swapchain(40, 512, 256))]);
        let layers = compositor.build_frame_layers(&FrameLayerInput {
            tracking_space: TRACKING,
            view_space: Some(VIEW),
            projection: None,
            depth: None,
            plan: &plan,
            world_to_tracking: Pose::from_position(Vec3::new(1.0, 0.0, 0.0)),
            world_to_meters: 100.0,
            layer_swapchains: &swapchains,
            emulated: None,
        });
        let [CompositionLayer::Overlay(overlay)] = layers.as_slice() else {
            panic!("expected a single overlay, got {layers:?}");
        };
        assert!(overlay
            .pose
            .position
            .abs_diff_eq(Vec3::new(1.0, 0.0, -2.0), 1e-5));
    }
}

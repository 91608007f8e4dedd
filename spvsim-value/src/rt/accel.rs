//! Acceleration structures and the stepwise ray trace.
//!
//! The BVH is one flat node vector shared (via `Rc`) between every clone of
//! an [`AccelStruct`] value; each clone carries its own [`Trace`] state.
//! `step_trace` advances a depth-first candidate frontier one primitive at
//! a time so shaders can accept or reject each hit in between.
use anyhow::bail;
use ordered_float::OrderedFloat;
use std::rc::Rc;

use crate::error::{anyhow, Result};
use crate::rt::flags::RayFlags;
use crate::rt::geom::{
    self, affine_inverse, compose, transform_point, transform_vector, Mat4x3, Vec3,
};
use crate::rt::node::{
    box_node_type, instance_node_type, procedural_node_type, triangle_node_type, BoxNode,
    InstanceNode, Node, NodeRef, ProceduralNode, TriangleNode,
};
use crate::ty::{Type, TypeArena, TypeBase, TypeHandle};
use crate::value::{Aggregate, Value};

pub const ACCEL_STRUCT_FIELDS: [&str; 5] = [
    "tlas",
    "box_nodes",
    "instance_nodes",
    "triangle_nodes",
    "procedural_nodes",
];

pub const HIT_KIND_FRONT_FACING_TRIANGLE: u32 = 0xFE;
pub const HIT_KIND_BACK_FACING_TRIANGLE: u32 = 0xFF;

/// What kind of hit a candidate intersection currently describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntersectionType {
    None,
    Triangle,
    Generated,
    Aabb,
}

/// One entry of the candidate frontier: a node to search plus the ray
/// context accumulated from the instances above it, and the hit data once
/// the node turns out to be a primitive.
#[derive(Clone, Debug)]
pub struct Intersection {
    pub kind: IntersectionType,
    pub search: usize,
    pub world_to_obj: Mat4x3,
    pub obj_to_world: Mat4x3,
    pub instance: Option<usize>,
    pub geometry_index: i32,
    pub primitive_index: i32,
    pub hit_t: f32,
    pub barycentrics: [f32; 2],
    pub is_opaque: bool,
    pub front_face: bool,
    pub hit_kind: u32,
}

impl Intersection {
    fn root(search: usize) -> Intersection {
        Intersection {
            kind: IntersectionType::None,
            search,
            world_to_obj: geom::IDENTITY,
            obj_to_world: geom::IDENTITY,
            instance: None,
            geometry_index: -1,
            primitive_index: -1,
            hit_t: f32::MAX,
            barycentrics: [0.0, 0.0],
            is_opaque: true,
            front_face: false,
            hit_kind: u32::MAX,
        }
    }

    fn descend(&self, search: usize) -> Intersection {
        let mut out = self.clone();
        out.search = search;
        out.kind = IntersectionType::None;
        out
    }

    pub fn is_valid_hit(&self) -> bool {
        !matches!(self.kind, IntersectionType::None)
    }

    /// Ray origin in the object space of the intersected instance.
    pub fn object_ray_origin(&self, trace: &Trace) -> Vec3 {
        transform_point(&self.world_to_obj, trace.ray_origin)
    }
    pub fn object_ray_direction(&self, trace: &Trace) -> Vec3 {
        transform_vector(&self.world_to_obj, trace.ray_direction)
    }
}

/// Outcome of one trace step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// No primitive was found; the frontier is exhausted.
    Exhausted,
    /// A primitive was intersected and can be committed directly.
    Found,
    /// A primitive was intersected but a shader must decide (non-opaque
    /// triangle or procedural geometry under a shader binding table).
    NeedsShader,
}

/// Traversal state of one ray through one acceleration structure.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    pub active: bool,
    pub candidates: Vec<Intersection>,
    /// Next candidate to examine. Pre-incremented by `step_trace`.
    candidate: usize,
    committed: Option<usize>,

    pub ray_flags: RayFlags,
    pub cull_mask: u32,
    pub ray_origin: Vec3,
    pub ray_direction: Vec3,
    pub ray_t_min: f32,
    pub ray_t_max: f32,

    pub use_sbt: bool,
    pub offset_sbt: u32,
    pub stride_sbt: u32,
    pub miss_index: u32,
}

impl Trace {
    pub fn candidate(&self) -> &Intersection {
        &self.candidates[self.candidate]
    }
    pub fn candidate_mut(&mut self) -> &mut Intersection {
        let at = self.candidate;
        &mut self.candidates[at]
    }
    pub fn has_committed(&self) -> bool {
        self.committed.is_some()
    }
    pub fn committed(&self) -> Option<&Intersection> {
        self.committed.map(|i| &self.candidates[i])
    }

    /// The best hit so far, or the candidate under examination when nothing
    /// has been committed.
    pub fn best(&self) -> &Intersection {
        match self.committed {
            Some(i) => &self.candidates[i],
            None => self.candidate(),
        }
    }
}

/// The BVH plus its top-level reference, shared between clones.
#[derive(Clone, Debug, Default)]
struct Bvh {
    nodes: Vec<Node>,
    tlas: NodeRef,
    boxes: usize,
    instances: usize,
    triangles: usize,
    procedurals: usize,
}

/// An acceleration-structure value.
#[derive(Clone, Debug)]
pub struct AccelStruct {
    ty: TypeHandle,
    bvh: Rc<Bvh>,
    trace: Trace,
}

impl AccelStruct {
    pub fn empty(ty: TypeHandle) -> AccelStruct {
        AccelStruct {
            ty,
            bvh: Rc::new(Bvh::default()),
            trace: Trace::default(),
        }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn trace(&self) -> &Trace {
        &self.trace
    }
    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }
    pub fn node_count(&self) -> usize {
        self.bvh.nodes.len()
    }
    pub fn partition_counts(&self) -> (usize, usize, usize, usize) {
        let bvh = &*self.bvh;
        (
            bvh.boxes,
            bvh.instances - bvh.boxes,
            bvh.triangles - bvh.instances,
            bvh.procedurals - bvh.triangles,
        )
    }

    /// Whether both values share the same node arena.
    pub fn shares_nodes(&self, other: &AccelStruct) -> bool {
        Rc::ptr_eq(&self.bvh, &other.bvh)
    }

    pub fn copy_from(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        match other {
            Value::AccelStruct(src) => {
                self.bvh = Rc::clone(&src.bvh);
                self.trace = src.trace.clone();
                Ok(())
            }
            Value::Struct(_) => self.load_struct(other, arena),
            _ => bail!("type mismatch: cannot copy an acceleration structure from {:?}",
                arena.get(other.ty()).base()),
        }
    }

    fn load_struct(&mut self, val: &Value, arena: &TypeArena) -> Result<()> {
        let s = match val {
            Value::Struct(agg) => agg,
            _ => unreachable!(),
        };
        if s.len() != ACCEL_STRUCT_FIELDS.len() {
            bail!(
                "acceleration structure input must have fields {:?}",
                ACCEL_STRUCT_FIELDS
            );
        }
        let tlas_got = s.get(0)?.extract_uvec("tlas", 2)?;
        let mut bvh = Bvh {
            tlas: NodeRef::new(tlas_got[0], tlas_got[1]),
            ..Bvh::default()
        };

        for node in s.get(1)?.as_aggregate()?.elements() {
            bvh.nodes.push(Node::Box(BoxNode::from_value(node, arena)?));
        }
        bvh.boxes = bvh.nodes.len();
        for node in s.get(2)?.as_aggregate()?.elements() {
            bvh.nodes
                .push(Node::Instance(InstanceNode::from_value(node, arena)?));
        }
        bvh.instances = bvh.nodes.len();
        for node in s.get(3)?.as_aggregate()?.elements() {
            bvh.nodes
                .push(Node::Triangle(TriangleNode::from_value(node, arena)?));
        }
        bvh.triangles = bvh.nodes.len();
        for node in s.get(4)?.as_aggregate()?.elements() {
            bvh.nodes
                .push(Node::Procedural(ProceduralNode::from_value(node, arena)?));
        }
        bvh.procedurals = bvh.nodes.len();

        // All nodes are loaded; resolve every reference in one pass.
        let (boxes, instances, triangles) = (bvh.boxes, bvh.instances, bvh.triangles);
        bvh.tlas.resolve(boxes, instances, triangles);
        for node in &mut bvh.nodes {
            node.resolve_references(boxes, instances, triangles);
        }
        if bvh.tlas.index() >= bvh.nodes.len() && !bvh.nodes.is_empty() {
            bail!("acceleration structure tlas reference is out of range");
        }
        self.bvh = Rc::new(bvh);
        self.trace = Trace::default();
        Ok(())
    }

    /// Externalisable struct form, partitioned node arrays in order.
    pub fn to_struct(&self, arena: &mut TypeArena) -> Result<Value> {
        let bvh: &Bvh = &self.bvh;
        let mut box_vals = Vec::new();
        let mut instance_vals = Vec::new();
        let mut triangle_vals = Vec::new();
        let mut procedural_vals = Vec::new();
        for node in &bvh.nodes {
            match node {
                Node::Box(n) => box_vals.push(n.to_value(arena)),
                Node::Instance(n) => instance_vals.push(n.to_value(arena)),
                Node::Triangle(n) => triangle_vals.push(n.to_value(arena)),
                Node::Procedural(n) => procedural_vals.push(n.to_value(arena)),
            }
        }

        let box_ty = box_node_type(arena, 0);
        let instance_ty = instance_node_type(arena);
        let triangle_ty = triangle_node_type(arena);
        let procedural_ty = procedural_node_type(arena);
        let arr = |arena: &mut TypeArena, el: TypeHandle, vals: Vec<Value>| {
            let ty = arena.intern(Type::array(vals.len() as u32, el));
            Value::Array(Aggregate::new(ty, vals))
        };
        let tlas = bvh.tlas.to_value(arena);
        let boxes = arr(arena, box_ty, box_vals);
        let instances = arr(arena, instance_ty, instance_vals);
        let triangles = arr(arena, triangle_ty, triangle_vals);
        let procedurals = arr(arena, procedural_ty, procedural_vals);

        let fields = vec![
            tlas.ty(),
            boxes.ty(),
            instances.ty(),
            triangles.ty(),
            procedurals.ty(),
        ];
        let names = ACCEL_STRUCT_FIELDS.iter().map(|s| (*s).to_owned()).collect();
        let ty = arena.intern(Type::structure_named(fields, names));
        Ok(Value::Struct(Aggregate::new(
            ty,
            vec![tlas, boxes, instances, triangles, procedurals],
        )))
    }

    /// Start a new trace through this structure.
    #[allow(clippy::too_many_arguments)]
    pub fn init_trace(
        &mut self,
        ray_flags: u32,
        cull_mask: u32,
        ray_origin: Vec3,
        ray_direction: Vec3,
        ray_t_min: f32,
        ray_t_max: f32,
        use_sbt: bool,
        offset_sbt: u32,
        stride_sbt: u32,
        miss_index: u32,
    ) {
        let trace = &mut self.trace;
        trace.ray_flags = RayFlags::new(ray_flags);
        trace.cull_mask = cull_mask;
        trace.ray_origin = ray_origin;
        trace.ray_direction = ray_direction;
        trace.ray_t_min = ray_t_min;
        trace.ray_t_max = ray_t_max;
        trace.use_sbt = use_sbt;
        trace.offset_sbt = offset_sbt;
        trace.stride_sbt = stride_sbt;
        trace.miss_index = miss_index;

        trace.committed = None;
        trace.candidates.clear();
        trace.active = !self.bvh.nodes.is_empty();
        if trace.active {
            // The frontier always starts at the TLAS root; the candidate
            // index sits before it because step_trace pre-increments.
            trace.candidates.push(Intersection::root(self.bvh.tlas.index()));
        }
        trace.candidate = usize::MAX;
    }

    /// Advance to the next intersected primitive, if any.
    pub fn step_trace(&mut self) -> StepResult {
        if !self.trace.active {
            return StepResult::Exhausted;
        }

        let mut found = StepResult::Exhausted;
        while self.trace.active
            && found == StepResult::Exhausted
            && {
                self.trace.candidate = self.trace.candidate.wrapping_add(1);
                self.trace.candidate < self.trace.candidates.len()
            }
        {
            found = self.step_node();
        }

        if self.trace.candidate.wrapping_add(1) >= self.trace.candidates.len() {
            self.trace.active = false;
        }
        found
    }

    fn step_node(&mut self) -> StepResult {
        let bvh = Rc::clone(&self.bvh);
        let trace = &mut self.trace;
        let at = trace.candidate;
        let node = &bvh.nodes[trace.candidates[at].search];
        match node {
            Node::Box(node) => {
                let ctx = trace.candidates[at].clone();
                let origin = ctx.object_ray_origin(trace);
                let direction = ctx.object_ray_direction(trace);
                if geom::ray_aabb_intersect(
                    origin,
                    direction,
                    trace.ray_t_min,
                    trace.ray_t_max,
                    node.min_bounds,
                    node.max_bounds,
                ) {
                    for child in &node.children {
                        trace.candidates.push(ctx.descend(child.index()));
                    }
                }
                StepResult::Exhausted
            }
            Node::Instance(node) => {
                if node.mask & trace.cull_mask == 0 {
                    return StepResult::Exhausted;
                }
                let ctx = trace.candidates[at].clone();
                let mut child = ctx.descend(node.child.index());
                let world_to_obj = affine_inverse(&node.transformation);
                child.world_to_obj = compose(&world_to_obj, &ctx.world_to_obj);
                child.obj_to_world = compose(&ctx.obj_to_world, &node.transformation);
                child.instance = Some(ctx.search);
                trace.candidates.push(child);
                StepResult::Exhausted
            }
            Node::Triangle(node) => Self::step_triangle(trace, node),
            Node::Procedural(node) => Self::step_procedural(trace, node),
        }
    }

    fn step_triangle(trace: &mut Trace, node: &TriangleNode) -> StepResult {
        let flags = trace.ray_flags;
        if flags.skip_triangles() {
            return StepResult::Exhausted;
        }
        let mut opaque = node.opaque;
        if flags.opaque() {
            opaque = true;
        } else if flags.no_opaque() {
            opaque = false;
        }
        if (flags.cull_opaque() && opaque) || (flags.cull_no_opaque() && !opaque) {
            return StepResult::Exhausted;
        }

        let cand = trace.candidate().clone();
        let origin = cand.object_ray_origin(trace);
        let direction = cand.object_ray_direction(trace);
        let (hit, t, u, v, front) = geom::ray_triangle_intersect(
            origin,
            direction,
            trace.ray_t_min,
            trace.ray_t_max,
            &node.vertices,
            flags.cull_back_facing_triangles(),
            flags.cull_front_facing_triangles(),
        );
        if !hit {
            return StepResult::Exhausted;
        }

        let use_sbt = trace.use_sbt;
        let cand = trace.candidate_mut();
        cand.kind = IntersectionType::Triangle;
        cand.hit_t = t;
        cand.barycentrics = [u, v];
        cand.geometry_index = node.geometry_index as i32;
        cand.primitive_index = node.primitive_index as i32;
        cand.is_opaque = opaque;
        cand.front_face = front;
        cand.hit_kind = if front {
            HIT_KIND_FRONT_FACING_TRIANGLE
        } else {
            HIT_KIND_BACK_FACING_TRIANGLE
        };
        if !opaque && use_sbt {
            StepResult::NeedsShader
        } else {
            StepResult::Found
        }
    }

    fn step_procedural(trace: &mut Trace, node: &ProceduralNode) -> StepResult {
        let flags = trace.ray_flags;
        if flags.skip_aabbs() {
            return StepResult::Exhausted;
        }
        let mut opaque = node.opaque;
        if flags.opaque() {
            opaque = true;
        } else if flags.no_opaque() {
            opaque = false;
        }
        if (flags.cull_opaque() && opaque) || (flags.cull_no_opaque() && !opaque) {
            return StepResult::Exhausted;
        }

        let cand = trace.candidate().clone();
        let origin = cand.object_ray_origin(trace);
        let direction = cand.object_ray_direction(trace);
        let entry = geom::ray_aabb_entry(
            origin,
            direction,
            trace.ray_t_min,
            trace.ray_t_max,
            node.min_bounds,
            node.max_bounds,
        );
        if entry.is_infinite() {
            return StepResult::Exhausted;
        }

        let use_sbt = trace.use_sbt;
        let ray_t_min = trace.ray_t_min;
        let cand = trace.candidate_mut();
        cand.kind = IntersectionType::Aabb;
        cand.hit_t = entry.max(ray_t_min);
        cand.geometry_index = node.geometry_index as i32;
        cand.primitive_index = node.primitive_index as i32;
        cand.is_opaque = opaque;
        cand.hit_kind = 0;
        if use_sbt {
            StepResult::NeedsShader
        } else {
            StepResult::Found
        }
    }

    /// Trace to completion, auto-committing every decidable hit. With
    /// `skip_first` the current candidate is analysed before stepping
    /// again (used when a shader already produced it).
    pub fn trace_ray(&mut self, mut skip_first: bool) -> Result<StepResult> {
        let mut intersected = false;
        loop {
            let found = if skip_first {
                skip_first = false;
                StepResult::Found
            } else {
                let found = self.step_trace();
                if found == StepResult::Found && self.trace.ray_flags.terminate_on_first_hit() {
                    self.trace.active = false;
                }
                found
            };

            match found {
                StepResult::Found => {
                    intersected = true;
                    match self.trace.candidate().kind {
                        IntersectionType::Triangle => self.confirm_intersection()?,
                        _ => {
                            let t = self.trace.candidate().hit_t;
                            self.generate_intersection(t)?;
                        }
                    }
                }
                StepResult::NeedsShader => return Ok(StepResult::NeedsShader),
                StepResult::Exhausted => {
                    return Ok(if intersected {
                        StepResult::Found
                    } else {
                        StepResult::Exhausted
                    });
                }
            }
        }
    }

    pub fn is_intersection_valid(&self, t_hit: f32) -> bool {
        t_hit >= self.trace.ray_t_min && t_hit <= self.trace.ray_t_max
    }

    /// Commit the candidate AABB intersection at the given distance.
    pub fn generate_intersection(&mut self, t_hit: f32) -> Result<()> {
        let trace = &mut self.trace;
        if trace.candidate().kind != IntersectionType::Aabb {
            bail!("cannot generate an intersection for a non-AABB candidate");
        }
        if let Some(committed) = trace.committed() {
            if OrderedFloat(t_hit) >= OrderedFloat(committed.hit_t) {
                return Ok(());
            }
        }
        trace.ray_t_max = t_hit;
        trace.candidate_mut().hit_t = t_hit;
        trace.committed = Some(trace.candidate);
        Ok(())
    }

    /// Commit the candidate triangle intersection.
    pub fn confirm_intersection(&mut self) -> Result<()> {
        let trace = &mut self.trace;
        if trace.candidate().kind != IntersectionType::Triangle {
            bail!("cannot confirm a non-triangle candidate");
        }
        let hit_t = trace.candidate().hit_t;
        if let Some(committed) = trace.committed() {
            if OrderedFloat(hit_t) >= OrderedFloat(committed.hit_t) {
                return Ok(());
            }
        }
        trace.ray_t_max = hit_t;
        trace.candidate_mut().kind = IntersectionType::Generated;
        trace.committed = Some(trace.candidate);
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.trace.active = false;
    }

    fn intersection(&self, committed: bool) -> Result<&Intersection> {
        if committed {
            self.trace
                .committed()
                .ok_or_else(|| anyhow!("no committed intersection"))
        } else {
            if self.trace.candidate >= self.trace.candidates.len() {
                bail!("no candidate intersection");
            }
            Ok(self.trace.candidate())
        }
    }

    pub fn intersection_type(&self, committed: bool) -> IntersectionType {
        if committed {
            self.trace
                .committed()
                .map(|i| i.kind)
                .unwrap_or(IntersectionType::None)
        } else if self.trace.candidate < self.trace.candidates.len() {
            self.trace.candidate().kind
        } else {
            IntersectionType::None
        }
    }

    pub fn intersection_t(&self, committed: bool) -> Result<f32> {
        Ok(self.intersection(committed)?.hit_t)
    }
    pub fn intersection_barycentrics(&self, committed: bool) -> Result<[f32; 2]> {
        Ok(self.intersection(committed)?.barycentrics)
    }
    pub fn intersection_front_face(&self, committed: bool) -> Result<bool> {
        let sect = self.intersection(committed)?;
        Ok(sect.front_face
            && matches!(
                sect.kind,
                IntersectionType::Triangle | IntersectionType::Generated
            ))
    }
    pub fn intersection_geometry_index(&self, committed: bool) -> Result<i32> {
        Ok(self.intersection(committed)?.geometry_index)
    }
    pub fn intersection_hit_kind(&self, committed: bool) -> Result<u32> {
        Ok(self.intersection(committed)?.hit_kind)
    }
    pub fn intersection_primitive_index(&self, committed: bool) -> Result<i32> {
        Ok(self.intersection(committed)?.primitive_index)
    }

    fn intersection_instance(&self, committed: bool) -> Result<Option<&InstanceNode>> {
        let sect = self.intersection(committed)?;
        Ok(sect.instance.and_then(|i| match &self.bvh.nodes[i] {
            Node::Instance(node) => Some(node),
            _ => None,
        }))
    }

    pub fn intersection_instance_custom_index(&self, committed: bool) -> Result<i32> {
        Ok(self
            .intersection_instance(committed)?
            .map(|i| i.custom_index as i32)
            .unwrap_or(-1))
    }
    pub fn intersection_instance_id(&self, committed: bool) -> Result<i32> {
        Ok(self
            .intersection_instance(committed)?
            .map(|i| i.id as i32)
            .unwrap_or(-1))
    }
    pub fn intersection_instance_sbt_offset(&self, committed: bool) -> Result<u32> {
        self.intersection_instance(committed)?
            .map(|i| i.sbt_record_offset)
            .ok_or_else(|| anyhow!("intersection has no instance"))
    }
    /// SBT record offset of the best intersection, 0 without an instance.
    pub fn best_sbt_offset(&self) -> u32 {
        let sect = match self.trace.committed() {
            Some(sect) => Some(sect),
            None if self.trace.candidate < self.trace.candidates.len() => {
                Some(self.trace.candidate())
            }
            None => None,
        };
        sect.and_then(|s| s.instance)
            .and_then(|i| match &self.bvh.nodes[i] {
                Node::Instance(node) => Some(node.sbt_record_offset),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn intersection_candidate_aabb_opaque(&self) -> Result<bool> {
        let sect = self.intersection(false)?;
        Ok(sect.kind == IntersectionType::Aabb && sect.is_opaque)
    }
    pub fn intersection_object_ray_origin(&self, committed: bool) -> Result<Vec3> {
        let sect = self.intersection(committed)?;
        Ok(sect.object_ray_origin(&self.trace))
    }
    pub fn intersection_object_ray_direction(&self, committed: bool) -> Result<Vec3> {
        let sect = self.intersection(committed)?;
        Ok(sect.object_ray_direction(&self.trace))
    }
    pub fn intersection_object_to_world(&self, committed: bool) -> Result<Mat4x3> {
        Ok(self.intersection(committed)?.obj_to_world)
    }
    pub fn intersection_world_to_object(&self, committed: bool) -> Result<Mat4x3> {
        Ok(self.intersection(committed)?.world_to_obj)
    }
    pub fn world_ray_origin(&self) -> Vec3 {
        self.trace.ray_origin
    }
    pub fn world_ray_direction(&self) -> Vec3 {
        self.trace.ray_direction
    }
}

/// A ray query: an acceleration structure plus its trace, stepped
/// explicitly by the shader.
#[derive(Clone, Debug)]
pub struct RayQuery {
    ty: TypeHandle,
    accel: Option<AccelStruct>,
}

impl RayQuery {
    pub fn new(ty: TypeHandle) -> RayQuery {
        RayQuery { ty, accel: None }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn cast(&mut self, ty: TypeHandle) {
        self.ty = ty;
    }

    pub fn set_accel_struct(&mut self, accel: AccelStruct) {
        self.accel = Some(accel);
    }
    pub fn accel_struct(&self) -> Result<&AccelStruct> {
        self.accel
            .as_ref()
            .ok_or_else(|| anyhow!("ray query has not been initialized"))
    }
    pub fn accel_struct_mut(&mut self) -> Result<&mut AccelStruct> {
        self.accel
            .as_mut()
            .ok_or_else(|| anyhow!("ray query has not been initialized"))
    }
}

/// Decide whether a type is the fixed acceleration-structure input layout.
pub fn is_accel_struct_layout(arena: &TypeArena, ty: TypeHandle) -> bool {
    let t = arena.get(ty);
    t.base() == TypeBase::Struct
        && t.names().len() == ACCEL_STRUCT_FIELDS.len()
        && t.names()
            .iter()
            .zip(ACCEL_STRUCT_FIELDS.iter())
            .all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_triangle_accel(arena: &mut TypeArena) -> AccelStruct {
        let tri = TriangleNode {
            geometry_index: 0,
            primitive_index: 0,
            opaque: true,
            vertices: [[-1.0, -1.0, 1.0], [0.0, 1.0, 1.0], [1.0, -1.0, 1.0]],
        };
        let root = BoxNode {
            min_bounds: [-1.0, -1.0, 0.5],
            max_bounds: [1.0, 1.0, 1.5],
            children: vec![NodeRef::new(3, 0)],
        };
        let mut accel = AccelStruct::empty(arena.intern(Type::accel_struct()));
        let mut bvh = Bvh {
            nodes: vec![Node::Box(root), Node::Triangle(tri)],
            tlas: NodeRef::new(1, 0),
            boxes: 1,
            instances: 1,
            triangles: 2,
            procedurals: 2,
        };
        bvh.tlas.resolve(1, 1, 2);
        for node in &mut bvh.nodes {
            node.resolve_references(1, 1, 2);
        }
        accel.bvh = Rc::new(bvh);
        accel
    }

    #[test]
    fn triangle_trace_commits_the_hit() {
        let mut arena = TypeArena::new();
        let mut accel = single_triangle_accel(&mut arena);
        accel.init_trace(
            0,
            0xFF,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        let status = accel.trace_ray(false).unwrap();
        assert_eq!(status, StepResult::Found);
        assert!(accel.trace().has_committed());
        let t = accel.intersection_t(true).unwrap();
        assert!((t - 1.0).abs() < 1e-5);
        assert!(accel.intersection_front_face(true).unwrap());
        assert_eq!(accel.intersection_type(true), IntersectionType::Generated);
        // Commit clamps the search interval.
        assert!(accel.trace().ray_t_max <= 1.0 + 1e-5);
    }

    #[test]
    fn miss_reports_exhausted() {
        let mut arena = TypeArena::new();
        let mut accel = single_triangle_accel(&mut arena);
        accel.init_trace(
            0,
            0xFF,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, -1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        let status = accel.trace_ray(false).unwrap();
        assert_eq!(status, StepResult::Exhausted);
        assert!(!accel.trace().has_committed());
    }

    fn two_triangle_accel(arena: &mut TypeArena) -> AccelStruct {
        // The far triangle sits first in the node order so the trace must
        // revise its committed hit when the near one shows up.
        let far = TriangleNode {
            geometry_index: 0,
            primitive_index: 0,
            opaque: true,
            vertices: [[-1.0, -1.0, 5.0], [0.0, 1.0, 5.0], [1.0, -1.0, 5.0]],
        };
        let near = TriangleNode {
            geometry_index: 0,
            primitive_index: 1,
            opaque: true,
            vertices: [[-1.0, -1.0, 2.0], [0.0, 1.0, 2.0], [1.0, -1.0, 2.0]],
        };
        let root = BoxNode {
            min_bounds: [-1.0, -1.0, 0.0],
            max_bounds: [1.0, 1.0, 6.0],
            children: vec![NodeRef::new(3, 0), NodeRef::new(3, 1)],
        };
        let mut bvh = Bvh {
            nodes: vec![Node::Box(root), Node::Triangle(far), Node::Triangle(near)],
            tlas: NodeRef::new(1, 0),
            boxes: 1,
            instances: 1,
            triangles: 3,
            procedurals: 3,
        };
        bvh.tlas.resolve(1, 1, 3);
        for node in &mut bvh.nodes {
            node.resolve_references(1, 1, 3);
        }
        let mut accel = AccelStruct::empty(arena.intern(Type::accel_struct()));
        accel.bvh = Rc::new(bvh);
        accel
    }

    #[test]
    fn commits_never_raise_ray_t_max() {
        let mut arena = TypeArena::new();
        let mut accel = two_triangle_accel(&mut arena);
        accel.init_trace(
            0,
            0xFF,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        let mut last_t_max = accel.trace().ray_t_max;
        let mut commits = 0;
        loop {
            match accel.step_trace() {
                StepResult::Found => {
                    match accel.trace().candidate().kind {
                        IntersectionType::Triangle => accel.confirm_intersection().unwrap(),
                        _ => {
                            let t = accel.trace().candidate().hit_t;
                            accel.generate_intersection(t).unwrap();
                        }
                    }
                    assert!(accel.trace().ray_t_max <= last_t_max);
                    last_t_max = accel.trace().ray_t_max;
                    commits += 1;
                }
                _ => break,
            }
        }
        assert_eq!(commits, 2);
        // The near triangle wins regardless of node order.
        let t = accel.intersection_t(true).unwrap();
        assert!((t - 2.0).abs() < 1e-4);
        assert_eq!(accel.intersection_primitive_index(true).unwrap(), 1);
    }

    #[test]
    fn terminate_on_first_hit_commits_once() {
        const TERMINATE_ON_FIRST_HIT: u32 = 0x4;
        let mut arena = TypeArena::new();
        let mut accel = two_triangle_accel(&mut arena);
        accel.init_trace(
            TERMINATE_ON_FIRST_HIT,
            0xFF,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        assert_eq!(accel.trace_ray(false).unwrap(), StepResult::Found);
        // Only the first-found hit committed; the trace deactivated before
        // the nearer triangle could be examined.
        let t = accel.intersection_t(true).unwrap();
        assert!((t - 5.0).abs() < 1e-4);
        assert!(!accel.trace().active);
    }

    #[test]
    fn cull_mask_skips_instances() {
        let mut arena = TypeArena::new();
        let tri = TriangleNode {
            geometry_index: 0,
            primitive_index: 0,
            opaque: true,
            vertices: [[-1.0, -1.0, 1.0], [0.0, 1.0, 1.0], [1.0, -1.0, 1.0]],
        };
        let inst = InstanceNode {
            transformation: geom::IDENTITY,
            child: NodeRef::new(3, 0),
            id: 0,
            custom_index: 7,
            mask: 0x02,
            sbt_record_offset: 0,
        };
        let mut bvh = Bvh {
            nodes: vec![Node::Instance(inst), Node::Triangle(tri)],
            tlas: NodeRef::new(2, 0),
            boxes: 0,
            instances: 1,
            triangles: 2,
            procedurals: 2,
        };
        bvh.tlas.resolve(0, 0, 1);
        for node in &mut bvh.nodes {
            node.resolve_references(0, 0, 1);
        }
        let mut accel = AccelStruct::empty(arena.intern(Type::accel_struct()));
        accel.bvh = Rc::new(bvh);

        accel.init_trace(
            0,
            0x01,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        assert_eq!(accel.trace_ray(false).unwrap(), StepResult::Exhausted);

        accel.init_trace(
            0,
            0x02,
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            0.001,
            1000.0,
            false,
            0,
            0,
            0,
        );
        assert_eq!(accel.trace_ray(false).unwrap(), StepResult::Found);
        assert_eq!(accel.intersection_instance_custom_index(true).unwrap(), 7);
    }
}

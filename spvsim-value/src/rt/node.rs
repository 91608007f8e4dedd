//! BVH nodes.
//!
//! Nodes are stored in one flat vector partitioned as
//! `[ box | instance | triangle | procedural ]`. A [`NodeRef`] is the
//! `(major, minor)` pair of the external form; after all nodes are loaded a
//! single resolve step translates it to a direct index.
use anyhow::bail;

use crate::error::{anyhow, Result};
use crate::rt::geom::Mat4x3;
use crate::ty::{Type, TypeArena, TypeHandle};
use crate::value::{Aggregate, Primitive, Value};

pub const BOX_NODE_FIELDS: [&str; 3] = ["min_bounds", "max_bounds", "child_nodes"];
pub const INSTANCE_NODE_FIELDS: [&str; 6] = [
    "transformation",
    "child_node",
    "id",
    "custom_index",
    "mask",
    "sbt_record_offset",
];
pub const TRIANGLE_NODE_FIELDS: [&str; 4] =
    ["geometry_index", "primitive_index", "opaque", "vertices"];
pub const PROCEDURAL_NODE_FIELDS: [&str; 5] = [
    "min_bounds",
    "max_bounds",
    "opaque",
    "geometry_index",
    "primitive_index",
];

/// A `(major, minor)` node reference: major selects the partition, minor
/// the offset within it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeRef {
    pub major: u32,
    pub minor: u32,
    resolved: usize,
}

impl NodeRef {
    pub fn new(major: u32, minor: u32) -> NodeRef {
        NodeRef {
            major,
            minor,
            resolved: 0,
        }
    }

    /// Translate to a flat index given the partition boundaries.
    pub fn resolve(&mut self, boxes: usize, instances: usize, triangles: usize) {
        let start = match self.major {
            0 => 0,
            1 => boxes,
            2 => instances,
            _ => triangles,
        };
        self.resolved = start + self.minor as usize;
    }

    pub fn index(&self) -> usize {
        self.resolved
    }

    pub fn to_value(&self, arena: &TypeArena) -> Value {
        Value::Array(Aggregate::new(
            arena.uvec2(),
            vec![
                Value::Primitive(Primitive::uint(arena, self.major)),
                Value::Primitive(Primitive::uint(arena, self.minor)),
            ],
        ))
    }
}

#[derive(Clone, Debug)]
pub struct BoxNode {
    pub min_bounds: [f32; 3],
    pub max_bounds: [f32; 3],
    pub children: Vec<NodeRef>,
}

#[derive(Clone, Debug)]
pub struct InstanceNode {
    /// Object-to-world transform.
    pub transformation: Mat4x3,
    pub child: NodeRef,
    pub id: u32,
    pub custom_index: u32,
    pub mask: u32,
    pub sbt_record_offset: u32,
}

#[derive(Clone, Debug)]
pub struct TriangleNode {
    pub geometry_index: u32,
    pub primitive_index: u32,
    pub opaque: bool,
    pub vertices: [[f32; 3]; 3],
}

#[derive(Clone, Debug)]
pub struct ProceduralNode {
    pub min_bounds: [f32; 3],
    pub max_bounds: [f32; 3],
    pub opaque: bool,
    pub geometry_index: u32,
    pub primitive_index: u32,
}

#[derive(Clone, Debug)]
pub enum Node {
    Box(BoxNode),
    Instance(InstanceNode),
    Triangle(TriangleNode),
    Procedural(ProceduralNode),
}

impl Node {
    pub fn resolve_references(&mut self, boxes: usize, instances: usize, triangles: usize) {
        match self {
            Node::Box(node) => {
                for child in &mut node.children {
                    child.resolve(boxes, instances, triangles);
                }
            }
            Node::Instance(node) => node.child.resolve(boxes, instances, triangles),
            Node::Triangle(_) | Node::Procedural(_) => {}
        }
    }
}

fn named_field<'a>(
    agg: &'a Aggregate,
    arena: &TypeArena,
    names: &[&str],
    idx: usize,
    what: &str,
) -> Result<&'a Value> {
    let ty_names = arena.get(agg.ty()).names();
    if let Some(name) = ty_names.get(idx) {
        if !name.is_empty() && name != names[idx] {
            bail!(
                "{} field #{} is named \"{}\" where \"{}\" was expected",
                what,
                idx + 1,
                name,
                names[idx]
            );
        }
    }
    agg.get(idx)
        .map_err(|_| anyhow!("{} is missing field \"{}\"", what, names[idx]))
}

fn extract_struct<'a>(
    val: &'a Value,
    arena: &TypeArena,
    names: &[&str],
    what: &str,
) -> Result<&'a Aggregate> {
    let agg = match val {
        Value::Struct(agg) => agg,
        _ => bail!("cannot read {} from a non-struct value", what),
    };
    if agg.len() > names.len() {
        bail!("{} has too many fields ({})", what, agg.len());
    }
    let _ = arena;
    Ok(agg)
}

fn vec3_of(val: &Value, what: &str) -> Result<[f32; 3]> {
    let v = val.extract_vec(what, 3)?;
    Ok([v[0], v[1], v[2]])
}

fn bool_of(val: &Value, what: &str) -> Result<bool> {
    match val {
        Value::Primitive(p) => Ok(p.bool_val()),
        _ => Err(anyhow!("{} must be a boolean", what)),
    }
}

fn node_ref_of(val: &Value, what: &str) -> Result<NodeRef> {
    let pair = val.extract_uvec(what, 2)?;
    Ok(NodeRef::new(pair[0], pair[1]))
}

impl BoxNode {
    pub fn from_value(val: &Value, arena: &TypeArena) -> Result<BoxNode> {
        let s = extract_struct(val, arena, &BOX_NODE_FIELDS, "box node")?;
        let min_bounds = vec3_of(
            named_field(s, arena, &BOX_NODE_FIELDS, 0, "box node")?,
            "min_bounds",
        )?;
        let max_bounds = vec3_of(
            named_field(s, arena, &BOX_NODE_FIELDS, 1, "box node")?,
            "max_bounds",
        )?;
        let children_val = named_field(s, arena, &BOX_NODE_FIELDS, 2, "box node")?;
        let children = children_val
            .as_aggregate()?
            .elements()
            .iter()
            .map(|c| node_ref_of(c, "child_nodes"))
            .collect::<Result<Vec<_>>>()?;
        Ok(BoxNode {
            min_bounds,
            max_bounds,
            children,
        })
    }

    pub fn to_value(&self, arena: &mut TypeArena) -> Value {
        let children: Vec<Value> = self.children.iter().map(|c| c.to_value(arena)).collect();
        let children_ty = arena.intern(Type::array(children.len() as u32, arena.uvec2()));
        let ty = box_node_type(arena, children.len() as u32);
        Value::Struct(Aggregate::new(
            ty,
            vec![
                vec3_value(arena, self.min_bounds),
                vec3_value(arena, self.max_bounds),
                Value::Array(Aggregate::new(children_ty, children)),
            ],
        ))
    }
}

impl InstanceNode {
    pub fn from_value(val: &Value, arena: &TypeArena) -> Result<InstanceNode> {
        let s = extract_struct(val, arena, &INSTANCE_NODE_FIELDS, "instance node")?;
        let transform_val =
            named_field(s, arena, &INSTANCE_NODE_FIELDS, 0, "instance node")?.as_aggregate()?;
        if transform_val.len() != 3 {
            bail!("instance node field \"transformation\" must be a mat4x3");
        }
        let mut transformation = [[0.0f32; 4]; 3];
        for (i, row) in transformation.iter_mut().enumerate() {
            let got = transform_val.get(i)?.extract_vec("transformation", 4)?;
            row.copy_from_slice(&got);
        }
        Ok(InstanceNode {
            transformation,
            child: node_ref_of(
                named_field(s, arena, &INSTANCE_NODE_FIELDS, 1, "instance node")?,
                "child_node",
            )?,
            id: named_field(s, arena, &INSTANCE_NODE_FIELDS, 2, "instance node")?
                .extract_u32("id")?,
            custom_index: named_field(s, arena, &INSTANCE_NODE_FIELDS, 3, "instance node")?
                .extract_u32("custom_index")?,
            mask: named_field(s, arena, &INSTANCE_NODE_FIELDS, 4, "instance node")?
                .extract_u32("mask")?,
            sbt_record_offset: named_field(s, arena, &INSTANCE_NODE_FIELDS, 5, "instance node")?
                .extract_u32("sbt_record_offset")?,
        })
    }

    pub fn to_value(&self, arena: &mut TypeArena) -> Value {
        let rows: Vec<Value> = self
            .transformation
            .iter()
            .map(|row| {
                let els = row
                    .iter()
                    .map(|&x| Value::Primitive(Primitive::float(arena, x)))
                    .collect();
                Value::Array(Aggregate::new(arena.vec4(), els))
            })
            .collect();
        let mat_ty = arena.intern(Type::array(3, arena.vec4()));
        let ty = instance_node_type(arena);
        Value::Struct(Aggregate::new(
            ty,
            vec![
                Value::Array(Aggregate::new(mat_ty, rows)),
                self.child.to_value(arena),
                Value::Primitive(Primitive::uint(arena, self.id)),
                Value::Primitive(Primitive::uint(arena, self.custom_index)),
                Value::Primitive(Primitive::uint(arena, self.mask)),
                Value::Primitive(Primitive::uint(arena, self.sbt_record_offset)),
            ],
        ))
    }
}

impl TriangleNode {
    pub fn from_value(val: &Value, arena: &TypeArena) -> Result<TriangleNode> {
        let s = extract_struct(val, arena, &TRIANGLE_NODE_FIELDS, "triangle node")?;
        let verts_val =
            named_field(s, arena, &TRIANGLE_NODE_FIELDS, 3, "triangle node")?.as_aggregate()?;
        if verts_val.len() != 3 {
            bail!("triangle node field \"vertices\" must be three vec3");
        }
        let mut vertices = [[0.0f32; 3]; 3];
        for (i, vert) in vertices.iter_mut().enumerate() {
            *vert = vec3_of(verts_val.get(i)?, "vertices")?;
        }
        Ok(TriangleNode {
            geometry_index: named_field(s, arena, &TRIANGLE_NODE_FIELDS, 0, "triangle node")?
                .extract_u32("geometry_index")?,
            primitive_index: named_field(s, arena, &TRIANGLE_NODE_FIELDS, 1, "triangle node")?
                .extract_u32("primitive_index")?,
            opaque: bool_of(
                named_field(s, arena, &TRIANGLE_NODE_FIELDS, 2, "triangle node")?,
                "opaque",
            )?,
            vertices,
        })
    }

    pub fn to_value(&self, arena: &mut TypeArena) -> Value {
        let verts: Vec<Value> = self.vertices.iter().map(|&v| vec3_value(arena, v)).collect();
        let verts_ty = arena.intern(Type::array(3, arena.vec3()));
        let ty = triangle_node_type(arena);
        Value::Struct(Aggregate::new(
            ty,
            vec![
                Value::Primitive(Primitive::uint(arena, self.geometry_index)),
                Value::Primitive(Primitive::uint(arena, self.primitive_index)),
                Value::Primitive(Primitive::boolean(arena, self.opaque)),
                Value::Array(Aggregate::new(verts_ty, verts)),
            ],
        ))
    }
}

impl ProceduralNode {
    pub fn from_value(val: &Value, arena: &TypeArena) -> Result<ProceduralNode> {
        let s = extract_struct(val, arena, &PROCEDURAL_NODE_FIELDS, "procedural node")?;
        Ok(ProceduralNode {
            min_bounds: vec3_of(
                named_field(s, arena, &PROCEDURAL_NODE_FIELDS, 0, "procedural node")?,
                "min_bounds",
            )?,
            max_bounds: vec3_of(
                named_field(s, arena, &PROCEDURAL_NODE_FIELDS, 1, "procedural node")?,
                "max_bounds",
            )?,
            opaque: bool_of(
                named_field(s, arena, &PROCEDURAL_NODE_FIELDS, 2, "procedural node")?,
                "opaque",
            )?,
            geometry_index: named_field(s, arena, &PROCEDURAL_NODE_FIELDS, 3, "procedural node")?
                .extract_u32("geometry_index")?,
            primitive_index: named_field(s, arena, &PROCEDURAL_NODE_FIELDS, 4, "procedural node")?
                .extract_u32("primitive_index")?,
        })
    }

    pub fn to_value(&self, arena: &mut TypeArena) -> Value {
        let ty = procedural_node_type(arena);
        Value::Struct(Aggregate::new(
            ty,
            vec![
                vec3_value(arena, self.min_bounds),
                vec3_value(arena, self.max_bounds),
                Value::Primitive(Primitive::boolean(arena, self.opaque)),
                Value::Primitive(Primitive::uint(arena, self.geometry_index)),
                Value::Primitive(Primitive::uint(arena, self.primitive_index)),
            ],
        ))
    }
}

fn vec3_value(arena: &TypeArena, v: [f32; 3]) -> Value {
    let els = v
        .iter()
        .map(|&x| Value::Primitive(Primitive::float(arena, x)))
        .collect();
    Value::Array(Aggregate::new(arena.vec3(), els))
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

pub fn box_node_type(arena: &mut TypeArena, num_children: u32) -> TypeHandle {
    let children = arena.intern(Type::array(num_children, arena.uvec2()));
    arena.intern(Type::structure_named(
        vec![arena.vec3(), arena.vec3(), children],
        names(&BOX_NODE_FIELDS),
    ))
}

pub fn instance_node_type(arena: &mut TypeArena) -> TypeHandle {
    let mat = arena.intern(Type::array(3, arena.vec4()));
    arena.intern(Type::structure_named(
        vec![
            mat,
            arena.uvec2(),
            arena.u32(),
            arena.u32(),
            arena.u32(),
            arena.u32(),
        ],
        names(&INSTANCE_NODE_FIELDS),
    ))
}

pub fn triangle_node_type(arena: &mut TypeArena) -> TypeHandle {
    let verts = arena.intern(Type::array(3, arena.vec3()));
    arena.intern(Type::structure_named(
        vec![arena.u32(), arena.u32(), arena.boolean(), verts],
        names(&TRIANGLE_NODE_FIELDS),
    ))
}

pub fn procedural_node_type(arena: &mut TypeArena) -> TypeHandle {
    arena.intern(Type::structure_named(
        vec![
            arena.vec3(),
            arena.vec3(),
            arena.boolean(),
            arena.u32(),
            arena.u32(),
        ],
        names(&PROCEDURAL_NODE_FIELDS),
    ))
}

//! Polymorphic runtime values.
//!
//! A [`Value`] is a sealed enum over the variants the interpreter can hold.
//! Copy, equality and printing dispatch by `match` on the variant. Values
//! carry their [`TypeHandle`]; every operation that needs the structure of
//! the type takes the owning [`TypeArena`].
use anyhow::bail;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{anyhow, Result};
use crate::image::{Image, Sampler};
use crate::rt::accel::{AccelStruct, RayQuery};
use crate::ty::{TypeArena, TypeBase, TypeHandle};
use crate::util::eq_float;

/// Named values flowing in and out of a program. Ordered so output files
/// print deterministically.
pub type ValueMap = BTreeMap<String, Value>;

/// A single 32-bit slot interpreted according to its type.
#[derive(Clone, Debug)]
pub struct Primitive {
    ty: TypeHandle,
    bits: u32,
}

impl Primitive {
    pub fn float(arena: &TypeArena, x: f32) -> Primitive {
        Primitive {
            ty: arena.f32(),
            bits: x.to_bits(),
        }
    }
    pub fn uint(arena: &TypeArena, x: u32) -> Primitive {
        Primitive {
            ty: arena.u32(),
            bits: x,
        }
    }
    pub fn int(arena: &TypeArena, x: i32) -> Primitive {
        Primitive {
            ty: arena.i32(),
            bits: x as u32,
        }
    }
    pub fn boolean(arena: &TypeArena, x: bool) -> Primitive {
        Primitive {
            ty: arena.boolean(),
            bits: x as u32,
        }
    }
    pub fn zeroed(ty: TypeHandle) -> Primitive {
        Primitive { ty, bits: 0 }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    /// Relabel the slot without touching the bits.
    pub fn cast(&mut self, ty: TypeHandle) {
        self.ty = ty;
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }
    pub fn set_bits(&mut self, bits: u32) {
        self.bits = bits;
    }
    pub fn u32_val(&self) -> u32 {
        self.bits
    }
    pub fn i32_val(&self) -> i32 {
        self.bits as i32
    }
    pub fn f32_val(&self) -> f32 {
        f32::from_bits(self.bits)
    }
    pub fn bool_val(&self) -> bool {
        self.bits != 0
    }

    /// Copy with the conversions the type union permits.
    pub fn copy_from(&mut self, other: &Primitive, arena: &TypeArena) -> Result<()> {
        let to = arena.get(self.ty).base();
        let from = arena.get(other.ty).base();
        self.bits = match (to, from) {
            (TypeBase::Float, TypeBase::Float) => other.bits,
            (TypeBase::Float, TypeBase::Uint) => (other.u32_val() as f32).to_bits(),
            (TypeBase::Float, TypeBase::Int) => (other.i32_val() as f32).to_bits(),
            (TypeBase::Uint, TypeBase::Uint) => other.bits,
            // No int -> uint: an int is probably negative.
            // No float -> uint: a float probably has a decimal component.
            (TypeBase::Int, TypeBase::Int) => other.bits,
            (TypeBase::Int, TypeBase::Uint) => other.bits,
            (TypeBase::Bool, TypeBase::Bool) => other.bits,
            (TypeBase::Bool, TypeBase::Uint) => (other.bits != 0) as u32,
            _ => bail!("type mismatch: cannot convert {:?} to {:?}", from, to),
        };
        Ok(())
    }

    /// Bit-preserving reinterpretation.
    pub fn copy_reinterp(&mut self, other: &Primitive) {
        self.bits = other.bits;
    }

    pub fn equals(&self, other: &Primitive, arena: &TypeArena) -> bool {
        if !arena.eq(self.ty, other.ty) {
            return false;
        }
        match arena.get(self.ty).base() {
            TypeBase::Float => eq_float(self.f32_val(), other.f32_val(), 6),
            TypeBase::Bool => self.bool_val() == other.bool_val(),
            _ => self.bits == other.bits,
        }
    }
}

/// Array or struct: an ordered list of owned child values.
#[derive(Clone, Debug)]
pub struct Aggregate {
    ty: TypeHandle,
    elements: Vec<Value>,
}

impl Aggregate {
    pub fn new(ty: TypeHandle, elements: Vec<Value>) -> Aggregate {
        Aggregate { ty, elements }
    }

    /// Construct with each element dummy-filled from its type.
    pub fn dummy(arena: &TypeArena, ty: TypeHandle) -> Result<Aggregate> {
        let mut agg = Aggregate {
            ty,
            elements: Vec::new(),
        };
        for i in 0..agg.expected_len(arena) {
            let el_ty = agg.type_at(arena, i)?;
            agg.elements.push(Value::construct(arena, el_ty)?);
        }
        Ok(agg)
    }

    /// Element count the type prescribes (current length for runtime
    /// arrays).
    pub fn expected_len(&self, arena: &TypeArena) -> usize {
        let ty = arena.get(self.ty);
        match ty.base() {
            TypeBase::Struct | TypeBase::AccelStruct => ty.fields().len(),
            _ => ty.size() as usize,
        }
    }

    pub fn type_at(&self, arena: &TypeArena, idx: usize) -> Result<TypeHandle> {
        let ty = arena.get(self.ty);
        match ty.base() {
            TypeBase::Struct => ty
                .fields()
                .get(idx)
                .copied()
                .ok_or_else(|| anyhow!("struct has no field {}", idx)),
            _ => ty.element(),
        }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    pub fn get(&self, idx: usize) -> Result<&Value> {
        self.elements
            .get(idx)
            .ok_or_else(|| anyhow!("index {} beyond the bound of composite", idx))
    }
    pub fn get_mut(&mut self, idx: usize) -> Result<&mut Value> {
        let len = self.elements.len();
        self.elements
            .get_mut(idx)
            .ok_or_else(|| anyhow!("index {} beyond the bound of composite ({})", idx, len))
    }
    pub fn elements(&self) -> &[Value] {
        &self.elements
    }
    pub fn elements_mut(&mut self) -> &mut [Value] {
        &mut self.elements
    }
    pub fn push(&mut self, value: Value) {
        self.elements.push(value);
    }

    /// Populate from the given values, constructing each element from its
    /// own type and converting.
    pub fn add_elements(&mut self, arena: &TypeArena, values: &[&Value]) -> Result<()> {
        let expect = self.expected_len(arena);
        if values.len() != expect {
            bail!(
                "could not add {} values to a composite of size {}",
                values.len(),
                expect
            );
        }
        for (i, val) in values.iter().enumerate() {
            let el_ty = self.type_at(arena, i)?;
            let mut el = Value::construct(arena, el_ty)?;
            el.copy_from(val, arena)
                .map_err(|e| anyhow!("could not add composite element {}: {}", i, e))?;
            self.elements.push(el);
        }
        Ok(())
    }

    pub fn copy_from(&mut self, other: &Aggregate, arena: &TypeArena) -> Result<()> {
        if self.elements.len() != other.elements.len() {
            // Runtime arrays take their length from the source.
            let ty = arena.get(self.ty);
            if ty.base() == TypeBase::Array && ty.size() == 0 {
                let el_ty = ty.element()?;
                self.elements = other
                    .elements
                    .iter()
                    .map(|src| {
                        let mut el = Value::construct(arena, el_ty)?;
                        el.copy_from(src, arena)?;
                        Ok(el)
                    })
                    .collect::<Result<Vec<_>>>()?;
                return Ok(());
            }
            bail!(
                "type mismatch: cannot copy a composite of size {} into one of size {}",
                other.elements.len(),
                self.elements.len()
            );
        }
        for (dst, src) in self.elements.iter_mut().zip(other.elements.iter()) {
            dst.copy_from(src, arena)?;
        }
        Ok(())
    }

    pub fn equals(&self, other: &Aggregate, arena: &TypeArena) -> bool {
        if !arena.eq(self.ty, other.ty) || self.elements.len() != other.elements.len() {
            return false;
        }
        self.elements
            .iter()
            .zip(other.elements.iter())
            .all(|(a, b)| a.equals(b, arena))
    }
}

/// An SSA head id plus a path of sub-indices into that head's aggregate.
#[derive(Clone, Debug)]
pub struct Pointer {
    ty: TypeHandle,
    head: u32,
    indices: Vec<u32>,
}

impl Pointer {
    pub fn new(ty: TypeHandle, head: u32, indices: Vec<u32>) -> Pointer {
        Pointer { ty, head, indices }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn head(&self) -> u32 {
        self.head
    }
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Split off the last index, for element-addressed bulk accesses. A
    /// pointer straight at the head decomposes to index 0.
    pub fn decompose(&self) -> (Pointer, u32) {
        let mut trimmed = self.clone();
        let back = trimmed.indices.pop().unwrap_or(0);
        (trimmed, back)
    }

    /// Walk the index path into `start`.
    pub fn dereference<'a>(&self, start: &'a Value) -> Result<&'a Value> {
        let mut at = start;
        for &idx in &self.indices {
            at = match at {
                Value::Array(agg) | Value::Struct(agg) => agg.get(idx as usize)?,
                Value::CoopMatrix(mat) => mat.get(idx as usize)?,
                _ => bail!("cannot extract from non-composite type"),
            };
        }
        Ok(at)
    }

    pub fn dereference_mut<'a>(&self, start: &'a mut Value) -> Result<&'a mut Value> {
        let mut at = start;
        for &idx in &self.indices {
            at = match at {
                Value::Array(agg) | Value::Struct(agg) => agg.get_mut(idx as usize)?,
                Value::CoopMatrix(mat) => mat.get_mut(idx as usize)?,
                _ => bail!("cannot extract from non-composite type"),
            };
        }
        Ok(at)
    }

    pub fn equals(&self, other: &Pointer) -> bool {
        self.head == other.head && self.indices == other.indices
    }
}

/// The slice of a logically larger matrix owned by one invocation.
#[derive(Clone, Debug)]
pub struct CoopMatrix {
    ty: TypeHandle,
    elements: Vec<Value>,
}

impl CoopMatrix {
    pub fn new(ty: TypeHandle) -> CoopMatrix {
        CoopMatrix {
            ty,
            elements: Vec::new(),
        }
    }

    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn num_rows(&self, arena: &TypeArena) -> u32 {
        arena.get(self.ty).num_rows()
    }
    /// Total element count of the logical matrix.
    pub fn total(&self, arena: &TypeArena) -> u32 {
        arena.get(self.ty).size()
    }
    /// Size of this invocation's slice.
    pub fn len(&self) -> usize {
        self.elements.len()
    }
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
    pub fn get(&self, idx: usize) -> Result<&Value> {
        self.elements
            .get(idx)
            .ok_or_else(|| anyhow!("index {} beyond cooperative matrix slice", idx))
    }
    pub fn get_mut(&mut self, idx: usize) -> Result<&mut Value> {
        self.elements
            .get_mut(idx)
            .ok_or_else(|| anyhow!("index beyond cooperative matrix slice"))
    }
    pub fn elements(&self) -> &[Value] {
        &self.elements
    }
    pub fn set_elements(&mut self, elements: Vec<Value>) {
        self.elements = elements;
    }

    /// The slice of the logical matrix this invocation owns:
    /// `[i*N/K, (i+1)*N/K)`.
    pub fn slice_range(total: u32, invocation: u32, num_invocations: u32) -> (u32, u32) {
        let beg = (invocation as u64 * total as u64 / num_invocations as u64) as u32;
        let fin = ((invocation as u64 + 1) * total as u64 / num_invocations as u64) as u32;
        (beg, fin)
    }

    /// Resize this invocation's slice to what the distribution dictates,
    /// dummy-filling any missing elements.
    pub fn enforce_size(
        &mut self,
        arena: &TypeArena,
        invocation: u32,
        num_invocations: u32,
    ) -> Result<()> {
        let (beg, fin) = Self::slice_range(self.total(arena), invocation, num_invocations);
        let want = (fin - beg) as usize;
        let el_ty = arena.get(self.ty).element()?;
        while self.elements.len() < want {
            self.elements.push(Value::construct(arena, el_ty)?);
        }
        self.elements.truncate(want);
        Ok(())
    }

    pub fn copy_from(&mut self, other: &CoopMatrix, arena: &TypeArena) -> Result<()> {
        self.copy_values(other.elements(), arena)
    }

    /// Replace the slice with converted copies of the given values. Inputs
    /// may provide the whole logical matrix; the slice is enforced at
    /// variable initialisation.
    pub fn copy_values(&mut self, values: &[Value], arena: &TypeArena) -> Result<()> {
        let el_ty = arena.get(self.ty).element()?;
        let mut elements = Vec::with_capacity(values.len());
        for val in values {
            let mut el = Value::construct(arena, el_ty)?;
            el.copy_from(val, arena)?;
            elements.push(el);
        }
        self.elements = elements;
        Ok(())
    }

    pub fn equals(&self, other: &CoopMatrix, arena: &TypeArena) -> bool {
        if !arena.eq(self.ty, other.ty) || self.elements.len() != other.elements.len() {
            return false;
        }
        self.elements
            .iter()
            .zip(other.elements.iter())
            .all(|(a, b)| a.equals(b, arena))
    }
}

/// A runtime value.
#[derive(Clone, Debug)]
pub enum Value {
    Primitive(Primitive),
    Array(Aggregate),
    Struct(Aggregate),
    Pointer(Pointer),
    String(TypeHandle, String),
    Image(Image),
    Sampler(Sampler),
    CoopMatrix(CoopMatrix),
    AccelStruct(AccelStruct),
    RayQuery(RayQuery),
}

impl Value {
    /// Create a value of the given type, dummy-filled.
    pub fn construct(arena: &TypeArena, ty: TypeHandle) -> Result<Value> {
        let base = arena.get(ty).base();
        let out = match base {
            TypeBase::Float | TypeBase::Uint | TypeBase::Int | TypeBase::Bool => {
                Value::Primitive(Primitive::zeroed(ty))
            }
            TypeBase::Array => Value::Array(Aggregate::dummy(arena, ty)?),
            TypeBase::Struct => Value::Struct(Aggregate::dummy(arena, ty)?),
            TypeBase::String => Value::String(ty, String::new()),
            TypeBase::Pointer => Value::Pointer(Pointer::new(ty, 0, Vec::new())),
            TypeBase::Image => Value::Image(Image::empty(arena, ty)?),
            TypeBase::Sampler => Value::Sampler(Sampler::empty(ty)),
            TypeBase::CoopMatrix => Value::CoopMatrix(CoopMatrix::new(ty)),
            TypeBase::AccelStruct => Value::AccelStruct(AccelStruct::empty(ty)),
            TypeBase::RayQuery => Value::RayQuery(RayQuery::new(ty)),
            TypeBase::Void => bail!("cannot construct void type"),
            TypeBase::Function => bail!("cannot construct function type"),
        };
        Ok(out)
    }

    /// Create a value of the given type from per-element inputs.
    pub fn construct_from(arena: &TypeArena, ty: TypeHandle, values: &[&Value]) -> Result<Value> {
        let base = arena.get(ty).base();
        match base {
            TypeBase::Float | TypeBase::Uint | TypeBase::Int | TypeBase::Bool => {
                if values.len() != 1 {
                    bail!("cannot construct a primitive from {} inputs", values.len());
                }
                let mut prim = Value::Primitive(Primitive::zeroed(ty));
                prim.copy_from(values[0], arena)?;
                Ok(prim)
            }
            TypeBase::Array | TypeBase::Struct => {
                let mut agg = Aggregate::new(ty, Vec::new());
                // Scalars may compose into a larger vector via mixed
                // scalar/vector inputs, so flatten one level when the
                // prescribed size asks for more elements than given.
                if base == TypeBase::Array && values.len() != agg.expected_len(arena) {
                    let mut flat: Vec<&Value> = Vec::new();
                    for &val in values {
                        match val {
                            Value::Array(inner) => flat.extend(inner.elements().iter()),
                            other => flat.push(other),
                        }
                    }
                    agg.add_elements(arena, &flat)?;
                } else {
                    agg.add_elements(arena, values)?;
                }
                Ok(match base {
                    TypeBase::Array => Value::Array(agg),
                    _ => Value::Struct(agg),
                })
            }
            TypeBase::CoopMatrix => {
                let mut mat = CoopMatrix::new(ty);
                let owned: Vec<Value> = values.iter().map(|v| (*v).clone()).collect();
                mat.copy_values(&owned, arena)?;
                Ok(Value::CoopMatrix(mat))
            }
            _ => bail!("cannot construct {:?} from inputs", base),
        }
    }

    pub fn ty(&self) -> TypeHandle {
        match self {
            Value::Primitive(x) => x.ty(),
            Value::Array(x) | Value::Struct(x) => x.ty(),
            Value::Pointer(x) => x.ty(),
            Value::String(ty, _) => *ty,
            Value::Image(x) => x.ty(),
            Value::Sampler(x) => x.ty(),
            Value::CoopMatrix(x) => x.ty(),
            Value::AccelStruct(x) => x.ty(),
            Value::RayQuery(x) => x.ty(),
        }
    }

    /// Whether the value holds nested values.
    pub fn is_nested(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Struct(_) | Value::CoopMatrix(_) | Value::Pointer(_)
        )
    }

    pub fn as_primitive(&self) -> Result<&Primitive> {
        match self {
            Value::Primitive(x) => Ok(x),
            _ => Err(anyhow!("value is not a primitive")),
        }
    }
    pub fn as_primitive_mut(&mut self) -> Result<&mut Primitive> {
        match self {
            Value::Primitive(x) => Ok(x),
            _ => Err(anyhow!("value is not a primitive")),
        }
    }
    pub fn as_aggregate(&self) -> Result<&Aggregate> {
        match self {
            Value::Array(x) | Value::Struct(x) => Ok(x),
            _ => Err(anyhow!("value is not a composite")),
        }
    }
    pub fn as_aggregate_mut(&mut self) -> Result<&mut Aggregate> {
        match self {
            Value::Array(x) | Value::Struct(x) => Ok(x),
            _ => Err(anyhow!("value is not a composite")),
        }
    }
    pub fn as_pointer(&self) -> Result<&Pointer> {
        match self {
            Value::Pointer(x) => Ok(x),
            _ => Err(anyhow!("value is not a pointer")),
        }
    }

    /// Read the value as a float vector of the given length.
    pub fn extract_vec(&self, name: &str, size: usize) -> Result<Vec<f32>> {
        let arr = match self {
            Value::Array(x) => x,
            _ => bail!("cannot extract vec from \"{}\": not an array", name),
        };
        if arr.len() != size {
            bail!(
                "cannot extract vec{} from \"{}\": the array has size {}",
                size,
                name,
                arr.len()
            );
        }
        arr.elements()
            .iter()
            .map(|e| e.as_primitive().map(Primitive::f32_val))
            .collect::<Result<Vec<_>>>()
            .map_err(|_| anyhow!("cannot extract vec from \"{}\": element is not a float", name))
    }

    /// Read the value as an unsigned vector of the given length.
    pub fn extract_uvec(&self, name: &str, size: usize) -> Result<Vec<u32>> {
        let arr = match self {
            Value::Array(x) => x,
            _ => bail!("cannot extract uvec from \"{}\": not an array", name),
        };
        if arr.len() != size {
            bail!(
                "cannot extract uvec{} from \"{}\": the array has size {}",
                size,
                name,
                arr.len()
            );
        }
        arr.elements()
            .iter()
            .map(|e| e.as_primitive().map(Primitive::u32_val))
            .collect()
    }

    pub fn extract_u32(&self, name: &str) -> Result<u32> {
        self.as_primitive()
            .map(Primitive::u32_val)
            .map_err(|_| anyhow!("cannot extract uint from \"{}\"", name))
    }

    /// Copy `other` into this value, converting where the type union
    /// permits.
    pub fn copy_from(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        match (self, other) {
            (Value::Primitive(dst), Value::Primitive(src)) => dst.copy_from(src, arena),
            (Value::Array(dst), Value::Array(src)) => dst.copy_from(src, arena),
            (Value::Struct(dst), Value::Struct(src)) => dst.copy_from(src, arena),
            (Value::Pointer(dst), Value::Pointer(src)) => {
                let ty = dst.ty;
                *dst = Pointer::new(ty, src.head, src.indices.clone());
                Ok(())
            }
            (Value::String(_, dst), Value::String(_, src)) => {
                *dst = src.clone();
                Ok(())
            }
            (Value::Image(dst), src) => dst.copy_from(src, arena),
            (Value::Sampler(dst), src) => dst.copy_from(src, arena),
            (Value::CoopMatrix(dst), Value::CoopMatrix(src)) => dst.copy_from(src, arena),
            (Value::CoopMatrix(dst), Value::Array(src)) => dst.copy_values(src.elements(), arena),
            (Value::AccelStruct(dst), src) => dst.copy_from(src, arena),
            (Value::RayQuery(dst), Value::RayQuery(src)) => {
                let ty = dst.ty();
                *dst = src.clone();
                dst.cast(ty);
                Ok(())
            }
            (dst, src) => bail!(
                "type mismatch: cannot copy {:?} into {:?}",
                arena.get(src.ty()).base(),
                arena.get(dst.ty()).base()
            ),
        }
    }

    /// Bit-preserving reinterpretation, used for payload packing.
    pub fn copy_reinterp(&mut self, other: &Value, arena: &TypeArena) -> Result<()> {
        match (&mut *self, other) {
            (Value::Primitive(dst), Value::Primitive(src)) => {
                dst.copy_reinterp(src);
                Ok(())
            }
            _ => self.copy_from(other, arena),
        }
    }

    /// Structural equality; floats compare equal within 6 decimal digits.
    pub fn equals(&self, other: &Value, arena: &TypeArena) -> bool {
        match (self, other) {
            (Value::Primitive(a), Value::Primitive(b)) => a.equals(b, arena),
            (Value::Array(a), Value::Array(b)) => a.equals(b, arena),
            (Value::Struct(a), Value::Struct(b)) => a.equals(b, arena),
            (Value::Pointer(a), Value::Pointer(b)) => a.equals(b),
            (Value::String(_, a), Value::String(_, b)) => a == b,
            (Value::Image(a), Value::Image(b)) => a.equals(b),
            (Value::CoopMatrix(a), Value::CoopMatrix(b)) => a.equals(b, arena),
            _ => false,
        }
    }

    /// Render for traces and the debugger.
    pub fn display(&self, arena: &TypeArena) -> String {
        let mut out = String::new();
        self.write_display(arena, &mut out);
        out
    }

    fn write_display(&self, arena: &TypeArena, out: &mut String) {
        match self {
            Value::Primitive(p) => match arena.get(p.ty()).base() {
                TypeBase::Float => {
                    let _ = write!(out, "{}", p.f32_val());
                }
                TypeBase::Int => {
                    let _ = write!(out, "{}", p.i32_val());
                }
                TypeBase::Bool => {
                    let _ = write!(out, "{}", p.bool_val());
                }
                _ => {
                    let _ = write!(out, "{}", p.u32_val());
                }
            },
            Value::Array(agg) => {
                out.push_str("[ ");
                for (i, e) in agg.elements().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    e.write_display(arena, out);
                }
                out.push_str(" ]");
            }
            Value::Struct(agg) => {
                let names = arena.get(agg.ty()).names().to_vec();
                out.push_str("{ ");
                for (i, e) in agg.elements().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if let Some(name) = names.get(i).filter(|n| !n.is_empty()) {
                        let _ = write!(out, "{} = ", name);
                    }
                    e.write_display(arena, out);
                }
                out.push_str(" }");
            }
            Value::Pointer(p) => {
                let _ = write!(out, "*%{}", p.head());
                for idx in p.indices() {
                    let _ = write!(out, ".{}", idx);
                }
            }
            Value::String(_, s) => {
                let _ = write!(out, "{:?}", s);
            }
            Value::Image(img) => {
                let _ = write!(out, "<image {}>", img.describe());
            }
            Value::Sampler(_) => out.push_str("<sampler>"),
            Value::CoopMatrix(mat) => {
                out.push_str("coopmat[ ");
                for (i, e) in mat.elements().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    e.write_display(arena, out);
                }
                out.push_str(" ]");
            }
            Value::AccelStruct(_) => out.push_str("<accel-struct>"),
            Value::RayQuery(_) => out.push_str("<ray-query>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;

    #[test]
    fn primitive_conversions() {
        let arena = TypeArena::new();
        let mut f = Primitive::float(&arena, 0.0);
        f.copy_from(&Primitive::uint(&arena, 7), &arena).unwrap();
        assert_eq!(f.f32_val(), 7.0);

        let mut i = Primitive::int(&arena, 0);
        i.copy_from(&Primitive::uint(&arena, 3), &arena).unwrap();
        assert_eq!(i.i32_val(), 3);

        let mut u = Primitive::uint(&arena, 0);
        assert!(u.copy_from(&Primitive::int(&arena, -1), &arena).is_err());
        assert!(u.copy_from(&Primitive::float(&arena, 0.5), &arena).is_err());

        let mut b = Primitive::boolean(&arena, false);
        b.copy_from(&Primitive::uint(&arena, 2), &arena).unwrap();
        assert!(b.bool_val());
    }

    #[test]
    fn aggregate_copy_requires_equal_length() {
        let mut arena = TypeArena::new();
        let f = arena.f32();
        let v3 = arena.intern(Type::array(3, f));
        let v2 = arena.intern(Type::array(2, f));
        let mut a = Value::construct(&arena, v3).unwrap();
        let b = Value::construct(&arena, v2).unwrap();
        assert!(a.copy_from(&b, &arena).is_err());
    }

    #[test]
    fn float_equality_is_six_digits() {
        let arena = TypeArena::new();
        let a = Value::Primitive(Primitive::float(&arena, 1.0));
        let b = Value::Primitive(Primitive::float(&arena, 1.0000004));
        assert!(a.equals(&b, &arena));
    }

    #[test]
    fn coop_matrix_slices_cover_the_total() {
        for total in [0u32, 1, 7, 16, 33] {
            for k in 1u32..=8 {
                let mut covered = 0;
                for i in 0..k {
                    let (beg, fin) = CoopMatrix::slice_range(total, i, k);
                    assert_eq!(beg, covered);
                    covered = fin;
                }
                assert_eq!(covered, total);
            }
        }
    }

    #[test]
    fn pointer_dereference_walks_the_path() {
        let mut arena = TypeArena::new();
        let f = arena.f32();
        let v2 = arena.intern(Type::array(2, f));
        let m2 = arena.intern(Type::array(2, v2));
        let ptr_ty = arena.intern(Type::pointer(f));

        let mut root = Value::construct(&arena, m2).unwrap();
        let ptr = Pointer::new(ptr_ty, 0, vec![1, 0]);
        let target = ptr.dereference_mut(&mut root).unwrap();
        target
            .copy_from(&Value::Primitive(Primitive::float(&arena, 2.5)), &arena)
            .unwrap();

        let read = ptr.dereference(&root).unwrap();
        assert_eq!(read.as_primitive().unwrap().f32_val(), 2.5);
    }
}

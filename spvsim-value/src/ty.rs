//! Structured representations of runtime value types.
//!
//! Types never own other types directly; they refer to them by [`TypeHandle`]
//! into a per-module [`TypeArena`]. The arena eagerly interns the handful of
//! types the interpreter itself needs (scalars, small vectors) so no lazily
//! initialised globals exist anywhere.
use anyhow::bail;

use crate::error::{anyhow, Result};

/// The base tag of a [`Type`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeBase {
    Float,
    Uint,
    Int,
    Bool,
    Struct,
    Array,
    String,
    Void,
    Function,
    Pointer,
    AccelStruct,
    RayQuery,
    Image,
    Sampler,
    CoopMatrix,
}

/// Index of a type within its [`TypeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeHandle(u32);
impl TypeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A value descriptor.
///
/// `sub_size` is base-dependent: the bit width for numerics, the element
/// count for arrays (0 for runtime arrays), the total element count for
/// cooperative matrices, and the 4-digit component-order encoding for
/// images. `aux` carries the row count for cooperative matrices and the
/// dimensionality for images.
#[derive(Clone, Debug)]
pub struct Type {
    base: TypeBase,
    sub_size: u32,
    aux: u32,
    sub_element: Option<TypeHandle>,
    fields: Vec<TypeHandle>,
    names: Vec<String>,
}

impl Type {
    fn new(base: TypeBase, sub_size: u32, sub_element: Option<TypeHandle>) -> Type {
        Type {
            base,
            sub_size,
            aux: 0,
            sub_element,
            fields: Vec::new(),
            names: Vec::new(),
        }
    }

    /// Factory for floats, uints, ints, bools and voids.
    pub fn primitive(base: TypeBase, size: u32) -> Type {
        debug_assert!(matches!(
            base,
            TypeBase::Float | TypeBase::Uint | TypeBase::Int | TypeBase::Bool | TypeBase::Void
        ));
        Type::new(base, size, None)
    }

    /// An array of `size` elements (0 for runtime arrays).
    pub fn array(size: u32, element: TypeHandle) -> Type {
        Type::new(TypeBase::Array, size, Some(element))
    }

    pub fn structure(fields: Vec<TypeHandle>) -> Type {
        let names = vec![String::new(); fields.len()];
        Type::structure_named(fields, names)
    }
    pub fn structure_named(fields: Vec<TypeHandle>, names: Vec<String>) -> Type {
        assert_eq!(fields.len(), names.len());
        let mut ty = Type::new(TypeBase::Struct, 0, None);
        ty.fields = fields;
        ty.names = names;
        ty
    }

    pub fn function(return_ty: TypeHandle, params: Vec<TypeHandle>) -> Type {
        let mut ty = Type::new(TypeBase::Function, 0, Some(return_ty));
        ty.names = vec![String::new(); params.len()];
        ty.fields = params;
        ty
    }

    pub fn pointer(pointee: TypeHandle) -> Type {
        Type::new(TypeBase::Pointer, 0, Some(pointee))
    }

    pub fn string() -> Type {
        Type::new(TypeBase::String, 0, None)
    }

    pub fn accel_struct() -> Type {
        Type::new(TypeBase::AccelStruct, 0, None)
    }

    pub fn ray_query() -> Type {
        Type::new(TypeBase::RayQuery, 0, None)
    }

    /// An image of the given dimensionality whose component order is the
    /// 4-digit encoding of spec'd channels (e.g. `1234` for RGBA).
    pub fn image(dim: u32, comps: u32, texel: TypeHandle) -> Type {
        let mut ty = Type::new(TypeBase::Image, comps, Some(texel));
        ty.aux = dim;
        ty
    }

    pub fn sampler(image: TypeHandle) -> Type {
        Type::new(TypeBase::Sampler, 0, Some(image))
    }

    /// A cooperative matrix of `rows` x `cols` elements distributed across
    /// the invocation group.
    pub fn coop_matrix(rows: u32, cols: u32, element: TypeHandle) -> Type {
        let mut ty = Type::new(TypeBase::CoopMatrix, rows * cols, Some(element));
        ty.aux = rows;
        ty
    }

    pub fn base(&self) -> TypeBase {
        self.base
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.base, TypeBase::Float | TypeBase::Uint | TypeBase::Int)
    }
    pub fn is_primitive(&self) -> bool {
        matches!(
            self.base,
            TypeBase::Float | TypeBase::Uint | TypeBase::Int | TypeBase::Bool
        )
    }
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self.base,
            TypeBase::Array | TypeBase::Struct | TypeBase::CoopMatrix
        )
    }

    /// Bit width of a numeric type.
    pub fn precision(&self) -> u32 {
        debug_assert!(self.is_numeric());
        self.sub_size
    }

    /// Element count of an array or cooperative matrix.
    pub fn size(&self) -> u32 {
        debug_assert!(matches!(self.base, TypeBase::Array | TypeBase::CoopMatrix));
        self.sub_size
    }

    /// Row count of a cooperative matrix.
    pub fn num_rows(&self) -> u32 {
        debug_assert_eq!(self.base, TypeBase::CoopMatrix);
        self.aux
    }

    /// Component-order encoding of an image.
    pub fn comps(&self) -> u32 {
        debug_assert_eq!(self.base, TypeBase::Image);
        self.sub_size
    }
    /// Dimensionality of an image.
    pub fn dim(&self) -> u32 {
        debug_assert_eq!(self.base, TypeBase::Image);
        self.aux
    }

    pub fn element(&self) -> Result<TypeHandle> {
        self.sub_element
            .ok_or_else(|| anyhow!("type has no element type"))
    }
    pub fn pointee(&self) -> Result<TypeHandle> {
        debug_assert_eq!(self.base, TypeBase::Pointer);
        self.sub_element
            .ok_or_else(|| anyhow!("pointer type has no pointee"))
    }
    pub fn return_ty(&self) -> Result<TypeHandle> {
        debug_assert_eq!(self.base, TypeBase::Function);
        self.sub_element
            .ok_or_else(|| anyhow!("function type has no return type"))
    }

    pub fn fields(&self) -> &[TypeHandle] {
        &self.fields
    }
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name_member(&mut self, idx: usize, name: String) -> Result<()> {
        if idx >= self.names.len() {
            bail!("cannot name member {} beyond existing fields", idx);
        }
        self.names[idx] = name;
        Ok(())
    }

    /// Whether the two types share a base for copy purposes. Plain structs
    /// are compatible with acceleration structures so inputs can arrive as
    /// ordinary structs.
    pub fn same_base(&self, other: &Type) -> bool {
        let struct_and_accel = (self.base == TypeBase::Struct
            && other.base == TypeBase::AccelStruct)
            || (self.base == TypeBase::AccelStruct && other.base == TypeBase::Struct);
        self.base == other.base || struct_and_accel
    }
}

/// The per-module type store.
///
/// Interning deduplicates structurally so handle equality is cheap to test
/// but never required for correctness: [`TypeArena::eq`] always compares
/// structurally, ignoring field names.
pub struct TypeArena {
    types: Vec<Type>,
    void: TypeHandle,
    boolean: TypeHandle,
    f32_: TypeHandle,
    u32_: TypeHandle,
    i32_: TypeHandle,
    string: TypeHandle,
    uvec2: TypeHandle,
    vec2: TypeHandle,
    vec3: TypeHandle,
    vec4: TypeHandle,
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeArena {
    pub fn new() -> TypeArena {
        let mut arena = TypeArena {
            types: Vec::new(),
            void: TypeHandle(0),
            boolean: TypeHandle(0),
            f32_: TypeHandle(0),
            u32_: TypeHandle(0),
            i32_: TypeHandle(0),
            string: TypeHandle(0),
            uvec2: TypeHandle(0),
            vec2: TypeHandle(0),
            vec3: TypeHandle(0),
            vec4: TypeHandle(0),
        };
        arena.void = arena.intern(Type::primitive(TypeBase::Void, 32));
        arena.boolean = arena.intern(Type::primitive(TypeBase::Bool, 32));
        arena.f32_ = arena.intern(Type::primitive(TypeBase::Float, 32));
        arena.u32_ = arena.intern(Type::primitive(TypeBase::Uint, 32));
        arena.i32_ = arena.intern(Type::primitive(TypeBase::Int, 32));
        arena.string = arena.intern(Type::string());
        arena.uvec2 = arena.intern(Type::array(2, arena.u32_));
        arena.vec2 = arena.intern(Type::array(2, arena.f32_));
        arena.vec3 = arena.intern(Type::array(3, arena.f32_));
        arena.vec4 = arena.intern(Type::array(4, arena.f32_));
        arena
    }

    pub fn void(&self) -> TypeHandle {
        self.void
    }
    pub fn boolean(&self) -> TypeHandle {
        self.boolean
    }
    pub fn f32(&self) -> TypeHandle {
        self.f32_
    }
    pub fn u32(&self) -> TypeHandle {
        self.u32_
    }
    pub fn i32(&self) -> TypeHandle {
        self.i32_
    }
    pub fn string(&self) -> TypeHandle {
        self.string
    }
    pub fn uvec2(&self) -> TypeHandle {
        self.uvec2
    }
    pub fn vec2(&self) -> TypeHandle {
        self.vec2
    }
    pub fn vec3(&self) -> TypeHandle {
        self.vec3
    }
    pub fn vec4(&self) -> TypeHandle {
        self.vec4
    }

    pub fn get(&self, handle: TypeHandle) -> &Type {
        &self.types[handle.index()]
    }
    pub fn get_mut(&mut self, handle: TypeHandle) -> &mut Type {
        &mut self.types[handle.index()]
    }

    /// Intern a type, returning the handle of a structurally equal type if
    /// one already exists. Named structs are kept distinct from anonymous
    /// ones so member names survive interning.
    pub fn intern(&mut self, ty: Type) -> TypeHandle {
        for (i, existing) in self.types.iter().enumerate() {
            if self.eq_types(existing, &ty) && existing.names == ty.names {
                return TypeHandle(i as u32);
            }
        }
        self.types.push(ty);
        TypeHandle((self.types.len() - 1) as u32)
    }

    /// Structural equality, ignoring field names.
    pub fn eq(&self, a: TypeHandle, b: TypeHandle) -> bool {
        a == b || self.eq_types(self.get(a), self.get(b))
    }

    fn eq_types(&self, a: &Type, b: &Type) -> bool {
        if a.base != b.base {
            return false;
        }
        match a.base {
            TypeBase::Float | TypeBase::Uint | TypeBase::Int => a.sub_size == b.sub_size,
            TypeBase::Bool | TypeBase::Void | TypeBase::String | TypeBase::AccelStruct
            | TypeBase::RayQuery | TypeBase::Sampler => true,
            TypeBase::Array | TypeBase::CoopMatrix => {
                a.sub_size == b.sub_size
                    && a.aux == b.aux
                    && self.eq_sub(a.sub_element, b.sub_element)
            }
            TypeBase::Image => {
                a.sub_size == b.sub_size
                    && a.aux == b.aux
                    && self.eq_sub(a.sub_element, b.sub_element)
            }
            TypeBase::Struct => {
                a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(b.fields.iter())
                        .all(|(x, y)| self.eq(*x, *y))
            }
            TypeBase::Function => {
                self.eq_sub(a.sub_element, b.sub_element)
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(b.fields.iter())
                        .all(|(x, y)| self.eq(*x, *y))
            }
            TypeBase::Pointer => self.eq_sub(a.sub_element, b.sub_element),
        }
    }

    fn eq_sub(&self, a: Option<TypeHandle>, b: Option<TypeHandle>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => self.eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// The type general to both inputs under the assignment-compatibility
    /// rules: `Uint` widens to any other primitive, identical primitives
    /// unify to the smaller width, arrays unify elementwise when sizes
    /// match.
    pub fn union_of(&mut self, a: TypeHandle, b: TypeHandle) -> Result<TypeHandle> {
        let (abase, asize) = {
            let t = self.get(a);
            (t.base, t.sub_size)
        };
        let (bbase, bsize) = {
            let t = self.get(b);
            (t.base, t.sub_size)
        };
        match abase {
            TypeBase::Void => {
                if bbase == TypeBase::Void {
                    Ok(a)
                } else {
                    Err(anyhow!("cannot unify void with a non-void type"))
                }
            }
            TypeBase::Uint => match bbase {
                TypeBase::Uint | TypeBase::Bool | TypeBase::Float | TypeBase::Int => {
                    Ok(self.intern(Type::primitive(bbase, asize.min(bsize))))
                }
                _ => Err(anyhow!("cannot unify uint with a non-primitive type")),
            },
            TypeBase::Bool | TypeBase::Float | TypeBase::Int => {
                if bbase == abase || bbase == TypeBase::Uint {
                    Ok(self.intern(Type::primitive(abase, asize.min(bsize))))
                } else {
                    Err(anyhow!(
                        "cannot unify {:?} with a type which is neither that nor uint",
                        abase
                    ))
                }
            }
            TypeBase::Array => {
                if bbase != TypeBase::Array {
                    return Err(anyhow!("cannot unify array and non-array types"));
                }
                if asize != bsize {
                    return Err(anyhow!(
                        "cannot unify arrays of different sizes ({} and {})",
                        asize,
                        bsize
                    ));
                }
                let ae = self.get(a).element()?;
                let be = self.get(b).element()?;
                let sub = self.union_of(ae, be)?;
                Ok(self.intern(Type::array(asize, sub)))
            }
            TypeBase::Struct => {
                if self.eq(a, b) {
                    Ok(a)
                } else {
                    Err(anyhow!("cannot unify distinct struct types"))
                }
            }
            _ => {
                if self.eq(a, b) {
                    Ok(a)
                } else {
                    Err(anyhow!("cannot unify {:?} types", abase))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut arena = TypeArena::new();
        let a = arena.intern(Type::primitive(TypeBase::Float, 32));
        assert_eq!(a, arena.f32());
        let v3 = arena.intern(Type::array(3, a));
        assert_eq!(v3, arena.vec3());
    }

    #[test]
    fn equality_ignores_field_names(){
        let mut arena = TypeArena::new();
        let f = arena.f32();
        let anon = arena.intern(Type::structure(vec![f, f]));
        let named = arena.intern(Type::structure_named(
            vec![f, f],
            vec!["x".to_owned(), "y".to_owned()],
        ));
        assert_ne!(anon, named);
        assert!(arena.eq(anon, named));
    }

    #[test]
    fn uint_widens_in_union() {
        let mut arena = TypeArena::new();
        let u = arena.u32();
        let f = arena.f32();
        let got = arena.union_of(u, f).unwrap();
        assert_eq!(arena.get(got).base(), TypeBase::Float);

        let b = arena.boolean();
        let got = arena.union_of(b, u).unwrap();
        assert_eq!(arena.get(got).base(), TypeBase::Bool);

        assert!(arena.union_of(f, b).is_err());
    }

    #[test]
    fn arrays_unify_elementwise() {
        let mut arena = TypeArena::new();
        let u = arena.u32();
        let f = arena.f32();
        let ua = arena.intern(Type::array(3, u));
        let fa = arena.intern(Type::array(3, f));
        let got = arena.union_of(ua, fa).unwrap();
        let el = arena.get(got).element().unwrap();
        assert_eq!(arena.get(el).base(), TypeBase::Float);

        let fa2 = arena.intern(Type::array(2, f));
        assert!(arena.union_of(fa, fa2).is_err());
    }

    #[test]
    fn struct_is_copy_compatible_with_accel_struct() {
        let mut arena = TypeArena::new();
        let s = arena.intern(Type::structure(vec![]));
        let a = arena.intern(Type::accel_struct());
        assert!(arena.get(s).same_base(arena.get(a)));
    }
}

//! Scalar and componentwise numeric helpers shared by the static and
//! dynamic dispatchers and the GLSL extension set.
use anyhow::bail;
use spvsim_value::ty::{TypeArena, TypeBase, TypeHandle};
use spvsim_value::value::{Aggregate, Primitive, Value};

use crate::error::{anyhow, Result};

/// A primitive lifted out of its 32-bit slot.
#[derive(Clone, Copy, Debug)]
pub enum Scalar {
    F(f32),
    U(u32),
    I(i32),
    B(bool),
}

impl Scalar {
    pub fn of(arena: &TypeArena, prim: &Primitive) -> Result<Scalar> {
        let out = match arena.get(prim.ty()).base() {
            TypeBase::Float => Scalar::F(prim.f32_val()),
            TypeBase::Uint => Scalar::U(prim.u32_val()),
            TypeBase::Int => Scalar::I(prim.i32_val()),
            TypeBase::Bool => Scalar::B(prim.bool_val()),
            base => bail!("{:?} is not a primitive type", base),
        };
        Ok(out)
    }

    pub fn as_f32(self) -> Result<f32> {
        match self {
            Scalar::F(x) => Ok(x),
            Scalar::U(x) => Ok(x as f32),
            Scalar::I(x) => Ok(x as f32),
            Scalar::B(_) => Err(anyhow!("expected a float operand")),
        }
    }
    pub fn as_u32(self) -> Result<u32> {
        match self {
            Scalar::U(x) => Ok(x),
            Scalar::I(x) => Ok(x as u32),
            _ => Err(anyhow!("expected an unsigned operand")),
        }
    }
    pub fn as_i32(self) -> Result<i32> {
        match self {
            Scalar::I(x) => Ok(x),
            Scalar::U(x) => Ok(x as i32),
            _ => Err(anyhow!("expected a signed operand")),
        }
    }
    pub fn as_bool(self) -> Result<bool> {
        match self {
            Scalar::B(x) => Ok(x),
            _ => Err(anyhow!("expected a boolean operand")),
        }
    }

    /// Raw slot bits, for shifts and bitwise ops over either signedness.
    pub fn bits(self) -> u32 {
        match self {
            Scalar::F(x) => x.to_bits(),
            Scalar::U(x) => x,
            Scalar::I(x) => x as u32,
            Scalar::B(x) => x as u32,
        }
    }

    fn into_primitive(self, arena: &TypeArena, ty: TypeHandle) -> Result<Primitive> {
        let mut prim = Primitive::zeroed(ty);
        let bits = match (arena.get(ty).base(), self) {
            (TypeBase::Float, Scalar::F(x)) => x.to_bits(),
            (TypeBase::Float, Scalar::U(x)) => (x as f32).to_bits(),
            (TypeBase::Float, Scalar::I(x)) => (x as f32).to_bits(),
            (TypeBase::Uint, Scalar::U(x)) => x,
            (TypeBase::Uint, Scalar::I(x)) => x as u32,
            (TypeBase::Int, Scalar::I(x)) => x as u32,
            (TypeBase::Int, Scalar::U(x)) => x,
            (TypeBase::Bool, Scalar::B(x)) => x as u32,
            (TypeBase::Bool, Scalar::U(x)) => (x != 0) as u32,
            (base, scalar) => bail!("cannot store {:?} into a {:?} result", scalar, base),
        };
        prim.set_bits(bits);
        Ok(prim)
    }
}

pub type UnaryFn<'a> = &'a dyn Fn(Scalar) -> Result<Scalar>;
pub type BinaryFn<'a> = &'a dyn Fn(Scalar, Scalar) -> Result<Scalar>;
pub type TernaryFn<'a> = &'a dyn Fn(Scalar, Scalar, Scalar) -> Result<Scalar>;

pub fn scalar_of(arena: &TypeArena, val: &Value) -> Result<Scalar> {
    Scalar::of(arena, val.as_primitive()?)
}

fn element_ty(arena: &TypeArena, ty: TypeHandle) -> Result<TypeHandle> {
    let t = arena.get(ty);
    match t.base() {
        TypeBase::Array | TypeBase::CoopMatrix => t.element(),
        _ => Ok(ty),
    }
}

/// Apply `f` componentwise over one operand, producing the result type.
pub fn componentwise_unary(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    a: &Value,
    f: UnaryFn,
) -> Result<Value> {
    match a {
        Value::Array(arr) => {
            let el_ty = element_ty(arena, ret_ty)?;
            let mut elements = Vec::with_capacity(arr.len());
            for e in arr.elements() {
                let s = f(scalar_of(arena, e)?)?;
                elements.push(Value::Primitive(s.into_primitive(arena, el_ty)?));
            }
            Ok(Value::Array(Aggregate::new(ret_ty, elements)))
        }
        _ => {
            let s = f(scalar_of(arena, a)?)?;
            Ok(Value::Primitive(s.into_primitive(arena, ret_ty)?))
        }
    }
}

/// Apply `f` componentwise over two operands of the same shape.
pub fn componentwise_binary(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    a: &Value,
    b: &Value,
    f: BinaryFn,
) -> Result<Value> {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                bail!("operand vectors have different sizes");
            }
            let el_ty = element_ty(arena, ret_ty)?;
            let mut elements = Vec::with_capacity(x.len());
            for (ea, eb) in x.elements().iter().zip(y.elements().iter()) {
                let s = f(scalar_of(arena, ea)?, scalar_of(arena, eb)?)?;
                elements.push(Value::Primitive(s.into_primitive(arena, el_ty)?));
            }
            Ok(Value::Array(Aggregate::new(ret_ty, elements)))
        }
        (Value::Array(_), _) | (_, Value::Array(_)) => {
            bail!("operands must both be vectors or both scalars")
        }
        _ => {
            let s = f(scalar_of(arena, a)?, scalar_of(arena, b)?)?;
            Ok(Value::Primitive(s.into_primitive(arena, ret_ty)?))
        }
    }
}

/// Apply `f` componentwise over three operands of the same shape.
pub fn componentwise_ternary(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    a: &Value,
    b: &Value,
    c: &Value,
    f: TernaryFn,
) -> Result<Value> {
    match (a, b, c) {
        (Value::Array(x), Value::Array(y), Value::Array(z)) => {
            if x.len() != y.len() || x.len() != z.len() {
                bail!("operand vectors have different sizes");
            }
            let el_ty = element_ty(arena, ret_ty)?;
            let mut elements = Vec::with_capacity(x.len());
            for i in 0..x.len() {
                let s = f(
                    scalar_of(arena, x.get(i)?)?,
                    scalar_of(arena, y.get(i)?)?,
                    scalar_of(arena, z.get(i)?)?,
                )?;
                elements.push(Value::Primitive(s.into_primitive(arena, el_ty)?));
            }
            Ok(Value::Array(Aggregate::new(ret_ty, elements)))
        }
        _ => {
            let s = f(
                scalar_of(arena, a)?,
                scalar_of(arena, b)?,
                scalar_of(arena, c)?,
            )?;
            Ok(Value::Primitive(s.into_primitive(arena, ret_ty)?))
        }
    }
}

/// Multiply each vector component by one scalar.
pub fn vector_times_scalar(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    vec: &Value,
    scalar: &Value,
) -> Result<Value> {
    let s = scalar_of(arena, scalar)?.as_f32()?;
    componentwise_unary(arena, ret_ty, vec, &|x| Ok(Scalar::F(x.as_f32()? * s)))
}

pub fn extract_f32s(arena: &TypeArena, val: &Value) -> Result<Vec<f32>> {
    match val {
        Value::Array(arr) => arr
            .elements()
            .iter()
            .map(|e| scalar_of(arena, e)?.as_f32())
            .collect(),
        _ => Ok(vec![scalar_of(arena, val)?.as_f32()?]),
    }
}

pub fn vec_value(arena: &TypeArena, ret_ty: TypeHandle, xs: &[f32]) -> Result<Value> {
    let el_ty = element_ty(arena, ret_ty)?;
    let elements = xs
        .iter()
        .map(|&x| Scalar::F(x).into_primitive(arena, el_ty).map(Value::Primitive))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Array(Aggregate::new(ret_ty, elements)))
}

/// Columns of a matrix value (an array of column vectors).
fn matrix_columns(arena: &TypeArena, m: &Value) -> Result<Vec<Vec<f32>>> {
    m.as_aggregate()?
        .elements()
        .iter()
        .map(|col| extract_f32s(arena, col))
        .collect()
}

pub fn matrix_times_vector(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    m: &Value,
    v: &Value,
) -> Result<Value> {
    let cols = matrix_columns(arena, m)?;
    let vs = extract_f32s(arena, v)?;
    if cols.len() != vs.len() {
        bail!("matrix column count does not match vector size");
    }
    let rows = cols.first().map(Vec::len).unwrap_or(0);
    let mut out = vec![0.0f32; rows];
    for (col, &x) in cols.iter().zip(vs.iter()) {
        for (i, &c) in col.iter().enumerate() {
            out[i] += c * x;
        }
    }
    vec_value(arena, ret_ty, &out)
}

pub fn vector_times_matrix(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    v: &Value,
    m: &Value,
) -> Result<Value> {
    let cols = matrix_columns(arena, m)?;
    let vs = extract_f32s(arena, v)?;
    let mut out = Vec::with_capacity(cols.len());
    for col in &cols {
        if col.len() != vs.len() {
            bail!("vector size does not match matrix row count");
        }
        out.push(col.iter().zip(vs.iter()).map(|(a, b)| a * b).sum());
    }
    vec_value(arena, ret_ty, &out)
}

pub fn matrix_times_matrix(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    a: &Value,
    b: &Value,
) -> Result<Value> {
    let a_cols = matrix_columns(arena, a)?;
    let b_cols = matrix_columns(arena, b)?;
    let rows = a_cols.first().map(Vec::len).unwrap_or(0);
    let col_ty = arena.get(ret_ty).element()?;
    let mut out_cols = Vec::with_capacity(b_cols.len());
    for b_col in &b_cols {
        if b_col.len() != a_cols.len() {
            bail!("matrix inner dimensions do not match");
        }
        let mut col = vec![0.0f32; rows];
        for (a_col, &x) in a_cols.iter().zip(b_col.iter()) {
            for (i, &c) in a_col.iter().enumerate() {
                col[i] += c * x;
            }
        }
        out_cols.push(vec_value(arena, col_ty, &col)?);
    }
    Ok(Value::Array(Aggregate::new(ret_ty, out_cols)))
}

pub fn transpose(arena: &TypeArena, ret_ty: TypeHandle, m: &Value) -> Result<Value> {
    let cols = matrix_columns(arena, m)?;
    let rows = cols.first().map(Vec::len).unwrap_or(0);
    let col_ty = arena.get(ret_ty).element()?;
    let mut out_cols = Vec::with_capacity(rows);
    for i in 0..rows {
        let col: Vec<f32> = cols.iter().map(|c| c[i]).collect();
        out_cols.push(vec_value(arena, col_ty, &col)?);
    }
    Ok(Value::Array(Aggregate::new(ret_ty, out_cols)))
}

pub fn dot(arena: &TypeArena, a: &Value, b: &Value) -> Result<f32> {
    let xs = extract_f32s(arena, a)?;
    let ys = extract_f32s(arena, b)?;
    if xs.len() != ys.len() {
        bail!("dot operands have different sizes");
    }
    Ok(xs.iter().zip(ys.iter()).map(|(x, y)| x * y).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvsim_value::ty::Type;

    #[test]
    fn componentwise_add() {
        let mut arena = TypeArena::new();
        let v3 = arena.intern(Type::array(3, arena.f32()));
        let a = vec_value(&arena, v3, &[1.0, 2.0, 3.0]).unwrap();
        let b = vec_value(&arena, v3, &[0.5, 0.5, 0.5]).unwrap();
        let sum = componentwise_binary(&arena, v3, &a, &b, &|x, y| {
            Ok(Scalar::F(x.as_f32()? + y.as_f32()?))
        })
        .unwrap();
        assert_eq!(extract_f32s(&arena, &sum).unwrap(), vec![1.5, 2.5, 3.5]);
    }

    #[test]
    fn matrix_vector_product() {
        let mut arena = TypeArena::new();
        let v2 = arena.vec2();
        let m22 = arena.intern(Type::array(2, v2));
        // Columns (1, 0) and (0, 2): scales y by 2.
        let c0 = vec_value(&arena, v2, &[1.0, 0.0]).unwrap();
        let c1 = vec_value(&arena, v2, &[0.0, 2.0]).unwrap();
        let m = Value::Array(Aggregate::new(m22, vec![c0, c1]));
        let v = vec_value(&arena, v2, &[3.0, 4.0]).unwrap();
        let got = matrix_times_vector(&arena, v2, &m, &v).unwrap();
        assert_eq!(extract_f32s(&arena, &got).unwrap(), vec![3.0, 8.0]);
    }
}

//! Extended instruction sets.
//!
//! `OpExtInstImport` installs a handle for one of the supported sets;
//! `OpExtInst` dispatches on that handle plus the per-set opcode. Only
//! GLSL.std.450 and the debug printf produce behaviour; the non-semantic
//! debug info set is accepted and ignored.
use anyhow::bail;
use spvsim_value::ty::{TypeArena, TypeHandle};
use spvsim_value::value::Value;

use crate::error::{anyhow, Result};
use crate::math::{self, Scalar};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    GlslStd450,
    RayTracing,
    RayQuery,
    DebugInfo,
    DebugPrintf,
}

impl Extension {
    pub fn from_name(name: &str) -> Result<Extension> {
        let ext = match name {
            "GLSL.std.450" => Extension::GlslStd450,
            "SPV_KHR_ray_tracing" => Extension::RayTracing,
            "SPV_KHR_ray_query" => Extension::RayQuery,
            "NonSemantic.Shader.DebugInfo.100" => Extension::DebugInfo,
            "NonSemantic.DebugPrintf" => Extension::DebugPrintf,
            _ => bail!("unsupported extension: {}", name),
        };
        Ok(ext)
    }

    pub fn index(self) -> u32 {
        match self {
            Extension::GlslStd450 => 0,
            Extension::RayTracing => 1,
            Extension::RayQuery => 2,
            Extension::DebugInfo => 3,
            Extension::DebugPrintf => 4,
        }
    }

    pub fn from_index(index: u32) -> Result<Extension> {
        let ext = match index {
            0 => Extension::GlslStd450,
            1 => Extension::RayTracing,
            2 => Extension::RayQuery,
            3 => Extension::DebugInfo,
            4 => Extension::DebugPrintf,
            _ => bail!("corrupted extension information"),
        };
        Ok(ext)
    }
}

/// Evaluate one GLSL.std.450 instruction over already-fetched operands.
/// `operands[i]` is the value of `OpExtInst` operand `4 + i`.
pub fn glsl_std_450(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    ext_opcode: u32,
    operands: &[Value],
) -> Result<Value> {
    let unary = |f: &dyn Fn(f32) -> f32| -> Result<Value> {
        math::componentwise_unary(arena, ret_ty, &operands[0], &|x| Ok(Scalar::F(f(x.as_f32()?))))
    };
    let binary = |f: &dyn Fn(f32, f32) -> f32| -> Result<Value> {
        math::componentwise_binary(arena, ret_ty, &operands[0], &operands[1], &|x, y| {
            Ok(Scalar::F(f(x.as_f32()?, y.as_f32()?)))
        })
    };
    let ternary = |f: &dyn Fn(f32, f32, f32) -> f32| -> Result<Value> {
        math::componentwise_ternary(
            arena,
            ret_ty,
            &operands[0],
            &operands[1],
            &operands[2],
            &|x, y, z| Ok(Scalar::F(f(x.as_f32()?, y.as_f32()?, z.as_f32()?))),
        )
    };

    let out = match ext_opcode {
        // Round
        1 => unary(&|x| x.round())?,
        // RoundEven
        2 => unary(&|x| {
            let r = x.round();
            if (x - x.trunc()).abs() == 0.5 && r as i64 % 2 != 0 {
                r - x.signum()
            } else {
                r
            }
        })?,
        // Trunc
        3 => unary(&|x| x.trunc())?,
        // FAbs
        4 => unary(&|x| x.abs())?,
        // SAbs
        5 => math::componentwise_unary(arena, ret_ty, &operands[0], &|x| {
            Ok(Scalar::I(x.as_i32()?.wrapping_abs()))
        })?,
        // FSign
        6 => unary(&|x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        })?,
        // SSign
        7 => math::componentwise_unary(arena, ret_ty, &operands[0], &|x| {
            Ok(Scalar::I(x.as_i32()?.signum()))
        })?,
        // Floor
        8 => unary(&|x| x.floor())?,
        // Ceil
        9 => unary(&|x| x.ceil())?,
        // Fract
        10 => unary(&|x| x - x.floor())?,
        // Radians
        11 => unary(&|x| x.to_radians())?,
        // Degrees
        12 => unary(&|x| x.to_degrees())?,
        // Sin
        13 => unary(&|x| x.sin())?,
        // Cos
        14 => unary(&|x| x.cos())?,
        // Tan
        15 => unary(&|x| x.tan())?,
        // Asin
        16 => unary(&|x| x.asin())?,
        // Acos
        17 => unary(&|x| x.acos())?,
        // Atan
        18 => unary(&|x| x.atan())?,
        // Atan2
        25 => binary(&|y, x| y.atan2(x))?,
        // Pow
        26 => binary(&|x, y| x.powf(y))?,
        // Exp
        27 => unary(&|x| x.exp())?,
        // Log
        28 => unary(&|x| x.ln())?,
        // Exp2
        29 => unary(&|x| x.exp2())?,
        // Log2
        30 => unary(&|x| x.log2())?,
        // Sqrt
        31 => unary(&|x| x.sqrt())?,
        // InverseSqrt
        32 => unary(&|x| 1.0 / x.sqrt())?,
        // FMin
        37 => binary(&|x, y| x.min(y))?,
        // UMin
        38 => math::componentwise_binary(arena, ret_ty, &operands[0], &operands[1], &|x, y| {
            Ok(Scalar::U(x.as_u32()?.min(y.as_u32()?)))
        })?,
        // SMin
        39 => math::componentwise_binary(arena, ret_ty, &operands[0], &operands[1], &|x, y| {
            Ok(Scalar::I(x.as_i32()?.min(y.as_i32()?)))
        })?,
        // FMax
        40 => binary(&|x, y| x.max(y))?,
        // UMax
        41 => math::componentwise_binary(arena, ret_ty, &operands[0], &operands[1], &|x, y| {
            Ok(Scalar::U(x.as_u32()?.max(y.as_u32()?)))
        })?,
        // SMax
        42 => math::componentwise_binary(arena, ret_ty, &operands[0], &operands[1], &|x, y| {
            Ok(Scalar::I(x.as_i32()?.max(y.as_i32()?)))
        })?,
        // FClamp
        43 => ternary(&|x, lo, hi| x.max(lo).min(hi))?,
        // UClamp
        44 => math::componentwise_ternary(
            arena,
            ret_ty,
            &operands[0],
            &operands[1],
            &operands[2],
            &|x, lo, hi| Ok(Scalar::U(x.as_u32()?.max(lo.as_u32()?).min(hi.as_u32()?))),
        )?,
        // SClamp
        45 => math::componentwise_ternary(
            arena,
            ret_ty,
            &operands[0],
            &operands[1],
            &operands[2],
            &|x, lo, hi| Ok(Scalar::I(x.as_i32()?.max(lo.as_i32()?).min(hi.as_i32()?))),
        )?,
        // FMix
        46 => ternary(&|x, y, a| x * (1.0 - a) + y * a)?,
        // Step
        48 => binary(&|edge, x| if x < edge { 0.0 } else { 1.0 })?,
        // SmoothStep
        49 => ternary(&|edge0, edge1, x| {
            let t = ((x - edge0) / (edge1 - edge0)).max(0.0).min(1.0);
            t * t * (3.0 - 2.0 * t)
        })?,
        // Fma
        50 => ternary(&|a, b, c| a.mul_add(b, c))?,
        // Length
        66 => {
            let v = math::extract_f32s(arena, &operands[0])?;
            let len = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            Value::Primitive(spvsim_value::value::Primitive::float(arena, len))
        }
        // Distance
        67 => {
            let a = math::extract_f32s(arena, &operands[0])?;
            let b = math::extract_f32s(arena, &operands[1])?;
            if a.len() != b.len() {
                bail!("distance operands have different sizes");
            }
            let len = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            Value::Primitive(spvsim_value::value::Primitive::float(arena, len))
        }
        // Cross
        68 => {
            let a = math::extract_f32s(arena, &operands[0])?;
            let b = math::extract_f32s(arena, &operands[1])?;
            if a.len() != 3 || b.len() != 3 {
                bail!("cross operands must be 3-component vectors");
            }
            let out = [
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
            ];
            math::vec_value(arena, ret_ty, &out)?
        }
        // Normalize
        69 => {
            let v = math::extract_f32s(arena, &operands[0])?;
            let len = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            let out: Vec<f32> = v.iter().map(|x| x / len).collect();
            math::vec_value(arena, ret_ty, &out)?
        }
        // FaceForward
        70 => {
            let n = math::extract_f32s(arena, &operands[0])?;
            let flip = math::dot(arena, &operands[1], &operands[2])? >= 0.0;
            let out: Vec<f32> = n.iter().map(|x| if flip { -x } else { *x }).collect();
            math::vec_value(arena, ret_ty, &out)?
        }
        // Reflect
        71 => {
            let i = math::extract_f32s(arena, &operands[0])?;
            let n = math::extract_f32s(arena, &operands[1])?;
            let d = math::dot(arena, &operands[0], &operands[1])?;
            let out: Vec<f32> = i
                .iter()
                .zip(n.iter())
                .map(|(i, n)| i - 2.0 * d * n)
                .collect();
            math::vec_value(arena, ret_ty, &out)?
        }
        // Refract
        72 => {
            let i = math::extract_f32s(arena, &operands[0])?;
            let n = math::extract_f32s(arena, &operands[1])?;
            let eta = math::scalar_of(arena, &operands[2])?.as_f32()?;
            let d = i.iter().zip(n.iter()).map(|(a, b)| a * b).sum::<f32>();
            let k = 1.0 - eta * eta * (1.0 - d * d);
            let out: Vec<f32> = if k < 0.0 {
                vec![0.0; i.len()]
            } else {
                i.iter()
                    .zip(n.iter())
                    .map(|(i, n)| eta * i - (eta * d + k.sqrt()) * n)
                    .collect()
            };
            math::vec_value(arena, ret_ty, &out)?
        }
        // FindILsb
        73 => math::componentwise_unary(arena, ret_ty, &operands[0], &|x| {
            let bits = x.bits();
            Ok(Scalar::I(if bits == 0 {
                -1
            } else {
                bits.trailing_zeros() as i32
            }))
        })?,
        // FindSMsb
        74 => math::componentwise_unary(arena, ret_ty, &operands[0], &|x| {
            let v = x.as_i32()?;
            let probe = if v < 0 { !v } else { v };
            Ok(Scalar::I(if probe == 0 {
                -1
            } else {
                31 - probe.leading_zeros() as i32
            }))
        })?,
        // FindUMsb
        75 => math::componentwise_unary(arena, ret_ty, &operands[0], &|x| {
            let v = x.as_u32()?;
            Ok(Scalar::I(if v == 0 {
                -1
            } else {
                31 - v.leading_zeros() as i32
            }))
        })?,
        _ => bail!("unknown GLSL.std.450 opcode: {}", ext_opcode),
    };
    Ok(out)
}

/// Render a `NonSemantic.DebugPrintf` call: `%`-directives consume the
/// trailing operand values in order.
pub fn debug_printf(arena: &TypeArena, format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut arg_at = 0;
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => {
                // Swallow the conversion directive; print the value the way
                // it knows itself.
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
                if let Some(arg) = args.get(arg_at) {
                    out.push_str(&arg.display(arena));
                    arg_at += 1;
                } else {
                    out.push_str("<missing>");
                }
            }
        }
    }
    out
}

/// Helper for `OpExtInst` to find the set an id refers to.
pub fn extension_of(set_value: &Value) -> Result<Extension> {
    let idx = set_value
        .extract_u32("extension set")
        .map_err(|_| anyhow!("corrupted extension information"))?;
    Extension::from_index(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvsim_value::value::Primitive;

    #[test]
    fn normalize_produces_unit_vectors() {
        let arena = TypeArena::new();
        let v3 = arena.vec3();
        let v = math::vec_value(&arena, v3, &[3.0, 0.0, 4.0]).unwrap();
        let got = glsl_std_450(&arena, v3, 69, &[v]).unwrap();
        let xs = math::extract_f32s(&arena, &got).unwrap();
        assert!((xs[0] - 0.6).abs() < 1e-6);
        assert!((xs[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn printf_consumes_arguments_in_order() {
        let arena = TypeArena::new();
        let args = vec![
            Value::Primitive(Primitive::uint(&arena, 3)),
            Value::Primitive(Primitive::float(&arena, 1.5)),
        ];
        let got = debug_printf(&arena, "x=%u y=%f 100%%", &args);
        assert_eq!(got, "x=3 y=1.5 100%");
    }

    #[test]
    fn unknown_sets_are_rejected() {
        assert!(Extension::from_name("SPV_AMD_gcn_shader").is_err());
        assert!(Extension::from_name("GLSL.std.450").is_ok());
    }
}

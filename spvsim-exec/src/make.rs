//! The `make_result` pass.
//!
//! Materialises every instruction whose value is statically knowable:
//! types, constants, variables, functions and labels. It doubles as the
//! fallback for the dynamic dispatcher, so arithmetic, conversions,
//! composite and image reads live here too and behave identically at
//! build time and run time.
use anyhow::bail;
use num_traits::FromPrimitive;
use spirv::{Op, StorageClass};
use spvsim_parse::{Instruction, Token};
use spvsim_value::data::{Data, DataManager, EntryPoint, Function, Variable, ViewHandle};
use spvsim_value::image::Sampler;
use spvsim_value::ty::{Type, TypeArena, TypeBase, TypeHandle};
use spvsim_value::value::{Aggregate, Pointer, Primitive, Value};

use crate::deco::{self, DecoQueue};
use crate::error::{anyhow, Result};
use crate::ext::{self, Extension};
use crate::math::{self, Scalar};

/// Shared mutable state of one program run.
pub struct Ctx<'a> {
    pub arena: &'a mut TypeArena,
    pub mgr: &'a mut DataManager,
}

impl<'a> Ctx<'a> {
    pub fn ref_id(&self, inst: &Instruction, idx: usize) -> Result<u32> {
        self.mgr.check_ref(inst.ref_at(idx)?)
    }

    pub fn get_type(&self, view: ViewHandle, inst: &Instruction, idx: usize) -> Result<TypeHandle> {
        let id = self.ref_id(inst, idx)?;
        self.mgr
            .get(view, id)?
            .as_type()
            .ok_or_else(|| anyhow!("%{} is not a type", id))
    }

    pub fn get_value(&self, view: ViewHandle, inst: &Instruction, idx: usize) -> Result<Value> {
        let id = self.ref_id(inst, idx)?;
        let data = self.mgr.get(view, id)?;
        data.value()
            .ok_or_else(|| anyhow!("%{} is not a value", id))
    }

    pub fn try_value(&self, view: ViewHandle, inst: &Instruction, idx: usize) -> Option<Value> {
        let id = inst.ref_at(idx).ok()?;
        self.mgr.get(view, id).ok().and_then(|d| d.value())
    }

    pub fn get_function(&self, view: ViewHandle, inst: &Instruction, idx: usize) -> Result<Function> {
        let id = self.ref_id(inst, idx)?;
        self.mgr
            .get(view, id)?
            .as_function()
            .cloned()
            .ok_or_else(|| anyhow!("%{} is not a function", id))
    }

    pub fn set(&mut self, view: ViewHandle, id: u32, data: Data) {
        self.mgr.set(view, id, data);
    }
}

fn comps_of_format(format: u32) -> u32 {
    use spirv::ImageFormat as F;
    match F::from_u32(format) {
        Some(F::R32f) | Some(F::R16f) | Some(F::R16) | Some(F::R8) | Some(F::R32i)
        | Some(F::R32ui) | Some(F::R16i) | Some(F::R16ui) | Some(F::R8i) | Some(F::R8ui) => 1000,
        Some(F::Rg32f) | Some(F::Rg16f) | Some(F::Rg16) | Some(F::Rg8) | Some(F::Rg32i)
        | Some(F::Rg32ui) | Some(F::Rg16i) | Some(F::Rg16ui) | Some(F::Rg8i) | Some(F::Rg8ui) => {
            1200
        }
        Some(F::R11fG11fB10f) => 1230,
        _ => 1234,
    }
}

/// Walk literal indices into a composite.
fn extract_literal_path<'v>(
    composite: &'v Value,
    inst: &Instruction,
    from_operand: usize,
) -> Result<&'v Value> {
    let mut at = composite;
    for idx in from_operand..inst.operands().len() {
        let idx = inst.u32_at(idx)? as usize;
        at = match at {
            Value::Array(agg) | Value::Struct(agg) => agg.get(idx)?,
            Value::CoopMatrix(mat) => mat.get(idx)?,
            _ => bail!("cannot extract from non-composite type"),
        };
    }
    Ok(at)
}

fn int_of(s: Scalar) -> Result<i64> {
    match s {
        Scalar::U(x) => Ok(x as i64),
        Scalar::I(x) => Ok(x as i64),
        _ => Err(anyhow!("expected an integer operand")),
    }
}

fn int_like(kind: Scalar, v: i64) -> Scalar {
    match kind {
        Scalar::I(_) => Scalar::I(v as i32),
        _ => Scalar::U(v as u32),
    }
}

/// Evaluate an integer/float/logical/conversion op over fetched operands.
/// Shared between the plain ops and `OpSpecConstantOp`.
pub fn eval_scalar_op(
    arena: &TypeArena,
    ret_ty: TypeHandle,
    op: Op,
    operands: &[Value],
) -> Result<Value> {
    let a = || -> Result<&Value> {
        operands.first().ok_or_else(|| anyhow!("missing operand"))
    };
    let b = || -> Result<&Value> {
        operands.get(1).ok_or_else(|| anyhow!("missing operand"))
    };
    let bin = |f: math::BinaryFn| -> Result<Value> {
        math::componentwise_binary(arena, ret_ty, a()?, b()?, f)
    };
    let un = |f: math::UnaryFn| -> Result<Value> {
        math::componentwise_unary(arena, ret_ty, a()?, f)
    };

    let out = match op {
        Op::SNegate => un(&|x| Ok(Scalar::I(x.as_i32()?.wrapping_neg())))?,
        Op::FNegate => un(&|x| Ok(Scalar::F(-x.as_f32()?)))?,
        Op::IAdd => bin(&|x, y| Ok(int_like(x, int_of(x)?.wrapping_add(int_of(y)?))))?,
        Op::ISub => bin(&|x, y| Ok(int_like(x, int_of(x)?.wrapping_sub(int_of(y)?))))?,
        Op::IMul => bin(&|x, y| Ok(int_like(x, int_of(x)?.wrapping_mul(int_of(y)?))))?,
        Op::FAdd => bin(&|x, y| Ok(Scalar::F(x.as_f32()? + y.as_f32()?)))?,
        Op::FSub => bin(&|x, y| Ok(Scalar::F(x.as_f32()? - y.as_f32()?)))?,
        Op::FMul => bin(&|x, y| Ok(Scalar::F(x.as_f32()? * y.as_f32()?)))?,
        Op::FDiv => bin(&|x, y| Ok(Scalar::F(x.as_f32()? / y.as_f32()?)))?,
        Op::UDiv => bin(&|x, y| {
            let d = y.as_u32()?;
            if d == 0 {
                bail!("division by zero");
            }
            Ok(Scalar::U(x.as_u32()? / d))
        })?,
        Op::SDiv => bin(&|x, y| {
            let d = y.as_i32()?;
            if d == 0 {
                bail!("division by zero");
            }
            Ok(Scalar::I(x.as_i32()?.wrapping_div(d)))
        })?,
        Op::UMod => bin(&|x, y| {
            let d = y.as_u32()?;
            if d == 0 {
                bail!("division by zero");
            }
            Ok(Scalar::U(x.as_u32()? % d))
        })?,
        Op::SRem => bin(&|x, y| {
            let d = y.as_i32()?;
            if d == 0 {
                bail!("division by zero");
            }
            Ok(Scalar::I(x.as_i32()?.wrapping_rem(d)))
        })?,
        Op::SMod => bin(&|x, y| {
            let d = y.as_i32()?;
            if d == 0 {
                bail!("division by zero");
            }
            // The result takes the sign of the divisor.
            let r = x.as_i32()?.wrapping_rem(d);
            Ok(Scalar::I(if r != 0 && (r < 0) != (d < 0) { r + d } else { r }))
        })?,
        Op::FRem => bin(&|x, y| Ok(Scalar::F(x.as_f32()? % y.as_f32()?)))?,
        Op::FMod => bin(&|x, y| {
            let (a, b) = (x.as_f32()?, y.as_f32()?);
            Ok(Scalar::F(a - b * (a / b).floor()))
        })?,
        Op::ShiftLeftLogical => bin(&|x, y| {
            Ok(int_like(x, ((x.bits() as u64) << (y.bits() & 31)) as i64))
        })?,
        Op::ShiftRightLogical => bin(&|x, y| Ok(int_like(x, (x.bits() >> (y.bits() & 31)) as i64)))?,
        Op::ShiftRightArithmetic => {
            bin(&|x, y| Ok(Scalar::I((x.bits() as i32) >> (y.bits() & 31))))?
        }
        Op::BitwiseOr => bin(&|x, y| Ok(int_like(x, (x.bits() | y.bits()) as i64)))?,
        Op::BitwiseXor => bin(&|x, y| Ok(int_like(x, (x.bits() ^ y.bits()) as i64)))?,
        Op::BitwiseAnd => bin(&|x, y| Ok(int_like(x, (x.bits() & y.bits()) as i64)))?,
        Op::Not => un(&|x| Ok(int_like(x, !x.bits() as i64)))?,
        Op::LogicalEqual => bin(&|x, y| Ok(Scalar::B(x.as_bool()? == y.as_bool()?)))?,
        Op::LogicalNotEqual => bin(&|x, y| Ok(Scalar::B(x.as_bool()? != y.as_bool()?)))?,
        Op::LogicalOr => bin(&|x, y| Ok(Scalar::B(x.as_bool()? || y.as_bool()?)))?,
        Op::LogicalAnd => bin(&|x, y| Ok(Scalar::B(x.as_bool()? && y.as_bool()?)))?,
        Op::LogicalNot => un(&|x| Ok(Scalar::B(!x.as_bool()?)))?,
        Op::IEqual => bin(&|x, y| Ok(Scalar::B(x.bits() == y.bits())))?,
        Op::INotEqual => bin(&|x, y| Ok(Scalar::B(x.bits() != y.bits())))?,
        Op::UGreaterThan => bin(&|x, y| Ok(Scalar::B(x.as_u32()? > y.as_u32()?)))?,
        Op::SGreaterThan => bin(&|x, y| Ok(Scalar::B(x.as_i32()? > y.as_i32()?)))?,
        Op::UGreaterThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_u32()? >= y.as_u32()?)))?,
        Op::SGreaterThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_i32()? >= y.as_i32()?)))?,
        Op::ULessThan => bin(&|x, y| Ok(Scalar::B(x.as_u32()? < y.as_u32()?)))?,
        Op::SLessThan => bin(&|x, y| Ok(Scalar::B(x.as_i32()? < y.as_i32()?)))?,
        Op::ULessThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_u32()? <= y.as_u32()?)))?,
        Op::SLessThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_i32()? <= y.as_i32()?)))?,
        Op::FOrdEqual => bin(&|x, y| Ok(Scalar::B(x.as_f32()? == y.as_f32()?)))?,
        Op::FOrdNotEqual => bin(&|x, y| {
            let (a, b) = (x.as_f32()?, y.as_f32()?);
            Ok(Scalar::B(!a.is_nan() && !b.is_nan() && a != b))
        })?,
        Op::FOrdLessThan => bin(&|x, y| Ok(Scalar::B(x.as_f32()? < y.as_f32()?)))?,
        Op::FOrdGreaterThan => bin(&|x, y| Ok(Scalar::B(x.as_f32()? > y.as_f32()?)))?,
        Op::FOrdLessThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_f32()? <= y.as_f32()?)))?,
        Op::FOrdGreaterThanEqual => bin(&|x, y| Ok(Scalar::B(x.as_f32()? >= y.as_f32()?)))?,
        Op::IsNan => un(&|x| Ok(Scalar::B(x.as_f32()?.is_nan())))?,
        Op::IsInf => un(&|x| Ok(Scalar::B(x.as_f32()?.is_infinite())))?,
        Op::ConvertFToU => un(&|x| Ok(Scalar::U(x.as_f32()? as u32)))?,
        Op::ConvertFToS => un(&|x| Ok(Scalar::I(x.as_f32()? as i32)))?,
        Op::ConvertSToF => un(&|x| Ok(Scalar::F(x.as_i32()? as f32)))?,
        Op::ConvertUToF => un(&|x| Ok(Scalar::F(x.as_u32()? as f32)))?,
        Op::UConvert => un(&|x| Ok(Scalar::U(x.as_u32()?)))?,
        Op::SConvert => un(&|x| Ok(Scalar::I(x.as_i32()?)))?,
        Op::FConvert => {
            let to_half = {
                let t = arena.get(ret_ty);
                let el = if t.base() == TypeBase::Array {
                    arena.get(t.element()?).precision()
                } else {
                    t.precision()
                };
                el == 16
            };
            un(&|x| {
                let v = x.as_f32()?;
                Ok(Scalar::F(if to_half {
                    half::f16::from_f32(v).to_f32()
                } else {
                    v
                }))
            })?
        }
        Op::Bitcast => {
            let mut out = Value::construct(arena, ret_ty)?;
            out.copy_reinterp(a()?, arena)?;
            out
        }
        Op::Dot => Value::Primitive({
            let d = math::dot(arena, a()?, b()?)?;
            Primitive::float(arena, d)
        }),
        Op::VectorTimesScalar => math::vector_times_scalar(arena, ret_ty, a()?, b()?)?,
        Op::MatrixTimesScalar => {
            let s = math::scalar_of(arena, b()?)?.as_f32()?;
            let cols = a()?.as_aggregate()?;
            let col_ty = arena.get(ret_ty).element()?;
            let mut out_cols = Vec::with_capacity(cols.len());
            for col in cols.elements() {
                out_cols.push(math::componentwise_unary(arena, col_ty, col, &|x| {
                    Ok(Scalar::F(x.as_f32()? * s))
                })?);
            }
            Value::Array(Aggregate::new(ret_ty, out_cols))
        }
        Op::MatrixTimesVector => math::matrix_times_vector(arena, ret_ty, a()?, b()?)?,
        Op::VectorTimesMatrix => math::vector_times_matrix(arena, ret_ty, a()?, b()?)?,
        Op::MatrixTimesMatrix => math::matrix_times_matrix(arena, ret_ty, a()?, b()?)?,
        Op::Transpose => math::transpose(arena, ret_ty, a()?)?,
        Op::Any | Op::All => {
            let arr = a()?.as_aggregate()?;
            let mut bools = arr
                .elements()
                .iter()
                .map(|e| math::scalar_of(arena, e)?.as_bool());
            let got = if op == Op::Any {
                bools.try_fold(false, |acc, b| b.map(|b| acc || b))?
            } else {
                bools.try_fold(true, |acc, b| b.map(|b| acc && b))?
            };
            Value::Primitive(Primitive::boolean(arena, got))
        }
        Op::Select => {
            let cond = a()?;
            let x = b()?;
            let y = operands.get(2).ok_or_else(|| anyhow!("missing operand"))?;
            match cond {
                Value::Array(conds) => {
                    let el_ty = arena.get(ret_ty).element()?;
                    let xs = x.as_aggregate()?;
                    let ys = y.as_aggregate()?;
                    let mut elements = Vec::with_capacity(conds.len());
                    for i in 0..conds.len() {
                        let pick = math::scalar_of(arena, conds.get(i)?)?.as_bool()?;
                        let src = if pick { xs.get(i)? } else { ys.get(i)? };
                        let mut el = Value::construct(arena, el_ty)?;
                        el.copy_from(src, arena)?;
                        elements.push(el);
                    }
                    Value::Array(Aggregate::new(ret_ty, elements))
                }
                _ => {
                    let pick = math::scalar_of(arena, cond)?.as_bool()?;
                    let mut out = Value::construct(arena, ret_ty)?;
                    out.copy_from(if pick { x } else { y }, arena)?;
                    out
                }
            }
        }
        _ => bail!("cannot evaluate {:?}", op),
    };
    Ok(out)
}

/// Create the instruction's result from its operands. Returns whether a
/// result was made. This is first called before execution for static
/// instructions, and doubles as the execution fallback for instructions
/// with shared behaviour. `insts` is the whole program, used to look up
/// queued decoration instructions.
pub fn make_result(
    ctx: &mut Ctx,
    view: ViewHandle,
    insts: &[Instruction],
    inst: &Instruction,
    location: usize,
    queue: Option<&DecoQueue>,
) -> Result<bool> {
    if !inst.has_result() {
        return Ok(false);
    }
    let result_at = ctx.mgr.check_ref(inst.result_id())?;
    let op = inst.op();

    let data = match op {
        Op::ExtInstImport => {
            let ext = Extension::from_name(inst.str_at(1)?)?;
            Data::Value(Value::Primitive(Primitive::uint(ctx.arena, ext.index())))
        }
        Op::ExtInst => {
            let set = ctx.get_value(view, inst, 2)?;
            let ext_opcode = inst.u32_at(3)?;
            match ext::extension_of(&set)? {
                Extension::GlslStd450 => {
                    let ret_ty = ctx.get_type(view, inst, 0)?;
                    let mut args = Vec::new();
                    for i in 4..inst.operands().len() {
                        args.push(ctx.get_value(view, inst, i)?);
                    }
                    let out = ext::glsl_std_450(ctx.arena, ret_ty, ext_opcode, &args)?;
                    Data::Value(out)
                }
                Extension::DebugPrintf => {
                    let format = match ctx.get_value(view, inst, 4)? {
                        Value::String(_, s) => s,
                        _ => bail!("debug printf format must be a string"),
                    };
                    let mut args = Vec::new();
                    for i in 5..inst.operands().len() {
                        args.push(ctx.get_value(view, inst, i)?);
                    }
                    println!("{}", ext::debug_printf(ctx.arena, &format, &args));
                    return Ok(true);
                }
                Extension::DebugInfo => return Ok(true),
                ext => bail!("extension {:?} has no ExtInst instructions", ext),
            }
        }
        Op::String => Data::Value(Value::String(
            ctx.arena.string(),
            inst.str_at(1)?.to_owned(),
        )),

        // Types.
        Op::TypeVoid => Data::Type(ctx.arena.void()),
        Op::TypeBool => Data::Type(ctx.arena.boolean()),
        Op::TypeInt => {
            let width = inst.u32_at(1)?;
            let base = if inst.u32_at(2)? == 0 {
                TypeBase::Uint
            } else {
                TypeBase::Int
            };
            Data::Type(ctx.arena.intern(Type::primitive(base, width)))
        }
        Op::TypeFloat => {
            let width = inst.u32_at(1)?;
            Data::Type(ctx.arena.intern(Type::primitive(TypeBase::Float, width)))
        }
        Op::TypeVector | Op::TypeMatrix => {
            let sub = ctx.get_type(view, inst, 1)?;
            let count = inst.u32_at(2)?;
            Data::Type(ctx.arena.intern(Type::array(count, sub)))
        }
        Op::TypeArray => {
            let sub = ctx.get_type(view, inst, 1)?;
            let len = ctx.get_value(view, inst, 2)?.extract_u32("array length")?;
            Data::Type(ctx.arena.intern(Type::array(len, sub)))
        }
        Op::TypeRuntimeArray => {
            let sub = ctx.get_type(view, inst, 1)?;
            Data::Type(ctx.arena.intern(Type::array(0, sub)))
        }
        Op::TypeStruct => {
            let mut fields = Vec::new();
            for i in 1..inst.operands().len() {
                fields.push(ctx.get_type(view, inst, i)?);
            }
            let mut ty = Type::structure(fields);
            if let Some(pending) = queue.and_then(|q| q.find(result_at)) {
                deco::apply_type_decos(insts, pending, |idx, name| {
                    let _ = ty.name_member(idx, name);
                })?;
            }
            Data::Type(ctx.arena.intern(ty))
        }
        Op::TypePointer => {
            let pointee = ctx.get_type(view, inst, 2)?;
            Data::Type(ctx.arena.intern(Type::pointer(pointee)))
        }
        Op::TypeFunction => {
            let ret = ctx.get_type(view, inst, 1)?;
            let mut params = Vec::new();
            for i in 2..inst.operands().len() {
                params.push(ctx.get_type(view, inst, i)?);
            }
            Data::Type(ctx.arena.intern(Type::function(ret, params)))
        }
        Op::TypeImage => {
            let texel = ctx.get_type(view, inst, 1)?;
            let dim = match spirv::Dim::from_u32(inst.u32_at(2)?) {
                Some(spirv::Dim::Dim1D) => 1,
                Some(spirv::Dim::Dim3D) => 3,
                _ => 2,
            };
            let comps = comps_of_format(inst.u32_at(7)?);
            Data::Type(ctx.arena.intern(Type::image(dim, comps, texel)))
        }
        Op::TypeSampler => {
            let image = {
                let f32_ty = ctx.arena.f32();
                ctx.arena.intern(Type::image(2, 1234, f32_ty))
            };
            Data::Type(ctx.arena.intern(Type::sampler(image)))
        }
        Op::TypeSampledImage => {
            let image = ctx.get_type(view, inst, 1)?;
            Data::Type(ctx.arena.intern(Type::sampler(image)))
        }
        Op::TypeAccelerationStructureKHR => Data::Type(ctx.arena.intern(Type::accel_struct())),
        Op::TypeRayQueryKHR => Data::Type(ctx.arena.intern(Type::ray_query())),
        Op::TypeCooperativeMatrixKHR => {
            let el = ctx.get_type(view, inst, 1)?;
            let rows = ctx.get_value(view, inst, 3)?.extract_u32("rows")?;
            let cols = ctx.get_value(view, inst, 4)?.extract_u32("columns")?;
            Data::Type(ctx.arena.intern(Type::coop_matrix(rows, cols, el)))
        }

        // Constants.
        Op::Constant => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut prim = Primitive::zeroed(ret_ty);
            prim.set_bits(inst.u32_at(2)?);
            Data::Value(Value::Primitive(prim))
        }
        Op::ConstantTrue | Op::ConstantFalse => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut prim = Primitive::boolean(ctx.arena, op == Op::ConstantTrue);
            prim.cast(ret_ty);
            Data::Value(Value::Primitive(prim))
        }
        Op::ConstantNull | Op::Undef => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            Data::Value(Value::construct(ctx.arena, ret_ty)?)
        }
        Op::ConstantComposite | Op::CompositeConstruct => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut values = Vec::new();
            for i in 2..inst.operands().len() {
                values.push(ctx.get_value(view, inst, i)?);
            }
            let refs: Vec<&Value> = values.iter().collect();
            Data::Value(Value::construct_from(ctx.arena, ret_ty, &refs)?)
        }
        Op::SpecConstant | Op::SpecConstantTrue | Op::SpecConstantFalse => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut prim = Primitive::zeroed(ret_ty);
            match op {
                Op::SpecConstant => prim.set_bits(inst.u32_at(2)?),
                Op::SpecConstantTrue => prim.set_bits(1),
                _ => {}
            }
            let mut var = Variable::make_spec_const(Value::Primitive(prim));
            if let Some(pending) = queue.and_then(|q| q.find(result_at)) {
                deco::apply_var_decos(insts, pending, &mut var)?;
            }
            Data::variable(var)
        }
        Op::SpecConstantComposite => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut values = Vec::new();
            for i in 2..inst.operands().len() {
                values.push(ctx.get_value(view, inst, i)?);
            }
            let refs: Vec<&Value> = values.iter().collect();
            let composed = Value::construct_from(ctx.arena, ret_ty, &refs)?;
            let mut var = Variable::make_spec_const(composed);
            if let Some(pending) = queue.and_then(|q| q.find(result_at)) {
                deco::apply_var_decos(insts, pending, &mut var)?;
            }
            Data::variable(var)
        }
        Op::SpecConstantOp => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let sub_op = Op::from_u32(inst.u32_at(2)?)
                .ok_or_else(|| anyhow!("unsupported opcode in OpSpecConstantOp"))?;
            let mut values = Vec::new();
            for i in 3..inst.operands().len() {
                values.push(ctx.get_value(view, inst, i)?);
            }
            Data::Value(eval_scalar_op(ctx.arena, ret_ty, sub_op, &values)?)
        }

        // Functions, labels and variables.
        Op::Function => {
            let fn_ty = ctx.get_type(view, inst, 3)?;
            let mut func = Function::new(fn_ty, location);
            let pending = queue.and_then(|q| q.find(result_at));
            if let Some(pending) = pending {
                if let Some(name) = deco::apply_func_decos(insts, pending)? {
                    func.set_name(name);
                }
                // An OpEntryPoint aimed at this function promotes it.
                let mut entry = None;
                for &at in pending {
                    let deco = &insts[at];
                    match deco.op() {
                        Op::EntryPoint => {
                            let mut ep = EntryPoint::new(func.clone());
                            ep.func.set_name(deco.str_at(2)?.to_owned());
                            entry = Some(ep);
                        }
                        _ => {}
                    }
                }
                if let Some(mut ep) = entry {
                    for &at in pending {
                        let deco = &insts[at];
                        match deco.op() {
                            Op::ExecutionMode | Op::ExecutionModeId => {
                                apply_execution_mode(ctx, view, deco, &mut ep)?;
                            }
                            _ => {}
                        }
                    }
                    ctx.set(view, result_at, Data::EntryPoint(ep));
                    return Ok(true);
                }
            }
            Data::Function(func)
        }
        Op::Label => Data::Value(Value::Primitive(Primitive::uint(
            ctx.arena,
            location as u32,
        ))),
        Op::Variable => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let storage = StorageClass::from_u32(inst.u32_at(2)?)
                .ok_or_else(|| anyhow!("invalid storage class"))?;
            let mut var = Variable::make(ctx.arena, ret_ty, storage)?;
            if inst.operands().len() > 3 {
                // The initializer may be dynamically generated, in which
                // case execution applies it later.
                if let Some(default) = ctx.try_value(view, inst, 3) {
                    var.set_value(&default, ctx.arena)?;
                }
            }
            if let Some(pending) = queue.and_then(|q| q.find(result_at)) {
                deco::apply_var_decos(insts, pending, &mut var)?;
            }
            Data::variable(var)
        }

        // Pointers and composites.
        Op::AccessChain | Op::InBoundsAccessChain => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let head = ctx.ref_id(inst, 2)?;
            let mut indices = Vec::new();
            for i in 3..inst.operands().len() {
                let at = ctx.get_value(view, inst, i)?;
                let base = ctx.arena.get(at.ty()).base();
                if base != TypeBase::Uint && base != TypeBase::Int {
                    bail!("access chain index is not an integer");
                }
                indices.push(at.as_primitive()?.u32_val());
            }
            Data::Value(Value::Pointer(Pointer::new(ret_ty, head, indices)))
        }
        Op::CopyObject => Data::Value(ctx.get_value(view, inst, 2)?),
        Op::VectorShuffle => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let first = ctx.get_value(view, inst, 2)?;
            let second = ctx.get_value(view, inst, 3)?;
            let fa = first.as_aggregate()?;
            let sa = second.as_aggregate()?;
            let mut picked = Vec::new();
            for i in 4..inst.operands().len() {
                let mut idx = inst.u32_at(i)? as usize;
                if idx < fa.len() {
                    picked.push(fa.get(idx)?);
                    continue;
                }
                idx -= fa.len();
                if idx < sa.len() {
                    picked.push(sa.get(idx)?);
                } else {
                    bail!("vector shuffle index is beyond the bounds of the source vectors");
                }
            }
            Data::Value(Value::construct_from(ctx.arena, ret_ty, &picked)?)
        }
        Op::CompositeExtract => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let composite = ctx.get_value(view, inst, 2)?;
            let picked = extract_literal_path(&composite, inst, 3)?;
            let mut out = Value::construct(ctx.arena, ret_ty)?;
            out.copy_from(picked, ctx.arena)?;
            Data::Value(out)
        }
        Op::CompositeInsert => {
            let object = ctx.get_value(view, inst, 2)?;
            let mut composite = ctx.get_value(view, inst, 3)?;
            {
                let mut at = &mut composite;
                for i in 4..inst.operands().len() {
                    let idx = inst.u32_at(i)? as usize;
                    at = match at {
                        Value::Array(agg) | Value::Struct(agg) => agg.get_mut(idx)?,
                        _ => bail!("cannot insert into non-composite type"),
                    };
                }
                at.copy_from(&object, ctx.arena)?;
            }
            Data::Value(composite)
        }
        Op::VectorExtractDynamic => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let vector = ctx.get_value(view, inst, 2)?;
            let idx = ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val() as usize;
            let mut out = Value::construct(ctx.arena, ret_ty)?;
            out.copy_from(vector.as_aggregate()?.get(idx)?, ctx.arena)?;
            Data::Value(out)
        }
        Op::VectorInsertDynamic => {
            let mut vector = ctx.get_value(view, inst, 2)?;
            let component = ctx.get_value(view, inst, 3)?;
            let idx = ctx.get_value(view, inst, 4)?.as_primitive()?.u32_val() as usize;
            vector
                .as_aggregate_mut()?
                .get_mut(idx)?
                .copy_from(&component, ctx.arena)?;
            Data::Value(vector)
        }
        Op::ArrayLength => {
            let structure = ctx.get_value(view, inst, 2)?;
            let member = inst.u32_at(3)? as usize;
            let len = structure.as_aggregate()?.get(member)?.as_aggregate()?.len();
            Data::Value(Value::Primitive(Primitive::uint(ctx.arena, len as u32)))
        }

        // Images.
        Op::SampledImage => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let image = match ctx.get_value(view, inst, 2)? {
                Value::Image(img) => img,
                _ => bail!("OpSampledImage needs an image operand"),
            };
            Data::Value(Value::Sampler(Sampler::from_image(ret_ty, image)))
        }
        Op::Image => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            match ctx.get_value(view, inst, 2)? {
                Value::Sampler(sampler) => {
                    let mut img = sampler.mip(0)?.clone();
                    img.cast(ret_ty);
                    Data::Value(Value::Image(img))
                }
                img @ Value::Image(_) => Data::Value(img),
                _ => bail!("OpImage needs a sampled image operand"),
            }
        }
        Op::ImageFetch | Op::ImageRead => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let image = match ctx.get_value(view, inst, 2)? {
                Value::Image(img) => img,
                Value::Sampler(sampler) => sampler.mip(0)?.clone(),
                _ => bail!("{:?} needs an image operand", op),
            };
            let coords = ctx.get_value(view, inst, 3)?;
            let (x, y, z) = integer_coords(ctx.arena, &coords)?;
            let texel = image.read(ctx.arena, x, y, z)?;
            Data::Value(compose_texel(ctx.arena, ret_ty, texel)?)
        }
        Op::ImageSampleImplicitLod | Op::ImageSampleExplicitLod => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let sampler = match ctx.get_value(view, inst, 2)? {
                Value::Sampler(s) => s,
                _ => bail!("image sampling needs a sampled image operand"),
            };
            let level = if op == Op::ImageSampleExplicitLod {
                ctx.get_value(view, inst, 5)?.as_primitive()?.f32_val().round() as u32
            } else {
                sampler.lod()
            };
            let image = sampler.mip(level)?;
            let coords = ctx.get_value(view, inst, 3)?;
            let norm = math::extract_f32s(ctx.arena, &coords)?;
            let (xx, yy, zz) = image.dims();
            let pick = |n: Option<&f32>, extent: u32| -> u32 {
                match (n, extent) {
                    (Some(&frac), e) if e > 0 => {
                        ((frac * e as f32).floor().max(0.0) as u32).min(e - 1)
                    }
                    _ => 0,
                }
            };
            let texel = image.read(
                ctx.arena,
                pick(norm.first(), xx),
                pick(norm.get(1), yy),
                pick(norm.get(2), zz),
            )?;
            Data::Value(compose_texel(ctx.arena, ret_ty, texel)?)
        }
        Op::ImageQuerySize | Op::ImageQuerySizeLod => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let image = match ctx.get_value(view, inst, 2)? {
                Value::Image(img) => img,
                Value::Sampler(sampler) => sampler.mip(0)?.clone(),
                _ => bail!("{:?} needs an image operand", op),
            };
            let (xx, yy, zz) = image.dims();
            let dims: Vec<u32> = [xx, yy, zz].iter().copied().filter(|&d| d > 0).collect();
            let values: Vec<Value> = dims
                .iter()
                .map(|&d| Value::Primitive(Primitive::uint(ctx.arena, d)))
                .collect();
            let refs: Vec<&Value> = values.iter().collect();
            Data::Value(Value::construct_from(ctx.arena, ret_ty, &refs)?)
        }

        // Everything else rides the shared arithmetic path.
        _ => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut values = Vec::new();
            for i in 2..inst.operands().len() {
                match inst.operand(i)? {
                    Token::Ref(_) => values.push(ctx.get_value(view, inst, i)?),
                    _ => break,
                }
            }
            Data::Value(eval_scalar_op(ctx.arena, ret_ty, op, &values)?)
        }
    };

    ctx.set(view, result_at, data);
    Ok(true)
}

fn apply_execution_mode(
    ctx: &Ctx,
    view: ViewHandle,
    deco: &Instruction,
    entry: &mut EntryPoint,
) -> Result<()> {
    use spirv::ExecutionMode as Mode;
    let mode = Mode::from_u32(deco.u32_at(1)?);
    match mode {
        Some(Mode::LocalSize) => {
            for i in 0..3 {
                if let Ok(size) = deco.u32_at(2 + i) {
                    entry.local_size[i] = size.max(1);
                }
            }
        }
        Some(Mode::LocalSizeId) => {
            for i in 0..3 {
                if deco.operands().len() > 2 + i {
                    let id = deco.ref_at(2 + i)?;
                    let size = ctx
                        .mgr
                        .get(view, id)?
                        .value()
                        .ok_or_else(|| anyhow!("LocalSizeId operand %{} is not a constant", id))?
                        .extract_u32("local size")?;
                    entry.local_size[i] = size.max(1);
                }
            }
        }
        // Other modes are recorded by their presence only.
        _ => {}
    }
    Ok(())
}

fn integer_coords(arena: &TypeArena, coords: &Value) -> Result<(u32, u32, u32)> {
    let scalars = match coords {
        Value::Array(arr) => arr
            .elements()
            .iter()
            .map(|e| math::scalar_of(arena, e))
            .collect::<Result<Vec<_>>>()?,
        _ => vec![math::scalar_of(arena, coords)?],
    };
    let as_int = |s: Option<&Scalar>| -> Result<u32> {
        match s {
            None => Ok(0),
            Some(Scalar::F(f)) => {
                if f.fract() != 0.0 {
                    bail!("unsupported float coordinates for an integer image access");
                }
                Ok(*f as u32)
            }
            Some(s) => s.as_u32(),
        }
    };
    Ok((
        as_int(scalars.first())?,
        as_int(scalars.get(1))?,
        as_int(scalars.get(2))?,
    ))
}

fn compose_texel(arena: &TypeArena, ret_ty: TypeHandle, texel: Vec<Value>) -> Result<Value> {
    let (want, el_ty) = match arena.get(ret_ty).base() {
        TypeBase::Array => (
            arena.get(ret_ty).size() as usize,
            arena.get(ret_ty).element()?,
        ),
        _ => (1, ret_ty),
    };
    let mut values = texel;
    while values.len() < want {
        // Missing channels read 0, except alpha which reads 1.
        let one = values.len() == 3;
        let mut filler = Primitive::zeroed(el_ty);
        match arena.get(el_ty).base() {
            TypeBase::Float => filler.set_bits((one as u32 as f32).to_bits()),
            _ => filler.set_bits(one as u32),
        }
        values.push(Value::Primitive(filler));
    }
    values.truncate(want);
    if want == 1 {
        return Ok(values.remove(0));
    }
    let refs: Vec<&Value> = values.iter().collect();
    Value::construct_from(arena, ret_ty, &refs)
}

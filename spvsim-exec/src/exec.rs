//! The per-instruction dynamic dispatcher.
//!
//! Invoked once per invocation per step. Only the current invocation's
//! frame stack may be modified; peer invocations are read for
//! cooperative-matrix slices. Returns whether the instruction blocks the
//! invocation (barriers).
use anyhow::bail;
use spirv::Op;
use spvsim_parse::{Instruction, Token};
use spvsim_value::data::{Data, Variable, ViewHandle};
use spvsim_value::rt::accel::{AccelStruct, IntersectionType, StepResult};
use spvsim_value::ty::{Type, TypeBase};
use spvsim_value::value::{Aggregate, CoopMatrix, Primitive, Value};
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{anyhow, Result};
use crate::frame::{Frame, RtTrigger};
use crate::make::{self, Ctx};
use crate::math::{self, Scalar};

/// Per-run execution settings.
#[derive(Clone, Copy, Debug)]
pub struct ExecEnv {
    pub verbose: bool,
    pub use_sbt: bool,
}

/// Where a pointer-shaped operand leads.
pub enum PointerTarget {
    Variable(Rc<RefCell<Variable>>, Vec<u32>),
    Slot(u32, Vec<u32>),
}

/// Resolve an operand which must be a variable or a pointer-typed value
/// into a target that can be read or written in place.
pub fn resolve_pointer(ctx: &Ctx, view: ViewHandle, id: u32) -> Result<PointerTarget> {
    match ctx.mgr.get(view, id)? {
        Data::Variable(var) => Ok(PointerTarget::Variable(Rc::clone(var), Vec::new())),
        Data::Value(Value::Pointer(ptr)) => {
            let head = ptr.head();
            let mut indices = ptr.indices().to_vec();
            match resolve_pointer(ctx, view, head)? {
                PointerTarget::Variable(var, mut head_indices) => {
                    head_indices.append(&mut indices);
                    Ok(PointerTarget::Variable(var, head_indices))
                }
                PointerTarget::Slot(slot, mut head_indices) => {
                    head_indices.append(&mut indices);
                    Ok(PointerTarget::Slot(slot, head_indices))
                }
            }
        }
        Data::Value(_) => Ok(PointerTarget::Slot(id, Vec::new())),
        _ => Err(anyhow!("%{} is neither a variable nor a pointer", id)),
    }
}

fn walk_path<'a>(mut at: &'a Value, path: &[u32]) -> Result<&'a Value> {
    for &idx in path {
        at = match at {
            Value::Array(agg) | Value::Struct(agg) => agg.get(idx as usize)?,
            Value::CoopMatrix(mat) => mat.get(idx as usize)?,
            _ => bail!("cannot extract from non-composite type"),
        };
    }
    Ok(at)
}

fn walk_path_mut<'a>(mut at: &'a mut Value, path: &[u32]) -> Result<&'a mut Value> {
    for &idx in path {
        at = match at {
            Value::Array(agg) | Value::Struct(agg) => agg.get_mut(idx as usize)?,
            Value::CoopMatrix(mat) => mat.get_mut(idx as usize)?,
            _ => bail!("cannot extract from non-composite type"),
        };
    }
    Ok(at)
}

/// Read the pointee as an owned value.
pub fn read_pointee(ctx: &Ctx, view: ViewHandle, target: &PointerTarget) -> Result<Value> {
    match target {
        PointerTarget::Variable(var, path) => {
            let var = var.borrow();
            Ok(walk_path(var.value(), path)?.clone())
        }
        PointerTarget::Slot(id, path) => {
            let data = ctx.mgr.get(view, *id)?;
            let val = data
                .value()
                .ok_or_else(|| anyhow!("%{} is not a value", id))?;
            Ok(walk_path(&val, path)?.clone())
        }
    }
}

/// Apply `f` to the pointee in place.
pub fn with_pointee_mut<T>(
    ctx: &mut Ctx,
    view: ViewHandle,
    target: &PointerTarget,
    f: impl FnOnce(&mut Ctx, &mut Value) -> Result<T>,
) -> Result<T> {
    match target {
        PointerTarget::Variable(var, path) => {
            let mut var = var.borrow_mut();
            // Take the value out of the variable so `f` can still reach
            // the arena and manager; the placeholder is never observable.
            let placeholder = Value::String(ctx.arena.string(), String::new());
            let mut value = std::mem::replace(var.value_mut(), placeholder);
            let out = (|| {
                let at = walk_path_mut(&mut value, path)?;
                f(ctx, at)
            })();
            *var.value_mut() = value;
            out
        }
        PointerTarget::Slot(id, path) => {
            let mut value = match ctx.mgr.get_mut(view, *id)? {
                Data::Value(val) => std::mem::replace(val, Value::Pointer(
                    spvsim_value::value::Pointer::new(ctx.arena.u32(), 0, Vec::new()),
                )),
                _ => bail!("%{} is not a value", id),
            };
            let out = (|| {
                let at = walk_path_mut(&mut value, path)?;
                f(ctx, at)
            })();
            if let Data::Value(val) = ctx.mgr.get_mut(view, *id)? {
                *val = value;
            }
            out
        }
    }
}

/// Pop the current frame. Returns whether the program counter should keep
/// advancing (false once an empty stack or a suspended ray-trace launcher
/// is reached).
fn pop_frame(ctx: &mut Ctx, stack: &mut Vec<Frame>) -> bool {
    let finished = match stack.pop() {
        Some(frame) => frame,
        None => return false,
    };
    let mut pop_to_rt = false;
    match stack.last_mut() {
        Some(prev) if prev.trigger() != RtTrigger::None => {
            pop_to_rt = true;
            if prev.trigger() == RtTrigger::Callable {
                // Callables may recurse directly, so mark the way back.
                prev.prepare_return();
            }
            // The launcher keeps the substage view to read results from.
        }
        _ => ctx.mgr.destroy_view(finished.view()),
    }
    !(pop_to_rt || stack.is_empty())
}

/// Pop back to the most recent suspended launcher, if any. Used when a
/// substage ends early but its launching trace must still read the
/// verdict out of the trigger state.
fn unwind_to_launcher(ctx: &mut Ctx, stack: &mut Vec<Frame>) {
    while pop_frame(ctx, stack) {}
}

/// Pop every frame of the invocation, suspended launchers included;
/// subsequent driver visits observe an empty stack and skip it.
fn terminate_invocation(ctx: &mut Ctx, stack: &mut Vec<Frame>) {
    while let Some(mut frame) = stack.pop() {
        if let Some(substage_view) = frame.disable_raytrace() {
            ctx.mgr.destroy_view(substage_view);
        }
        ctx.mgr.destroy_view(frame.view());
    }
}

/// Find the most recent frame below the top with a ray-trace trigger; it
/// must be of the expected kind.
fn launching_frame(stack: &[Frame], expected: RtTrigger) -> Result<Option<usize>> {
    for at in (0..stack.len().saturating_sub(1)).rev() {
        let trigger = stack[at].trigger();
        if trigger != RtTrigger::None {
            if trigger != expected {
                bail!(
                    "corrupted raytrace stack: launching frame is {} where {} was expected",
                    trigger.as_str(),
                    expected.as_str()
                );
            }
            return Ok(Some(at));
        }
    }
    Ok(None)
}

/// The `[valid_intersect, continue_search]` pair an any-hit substage
/// reports through.
fn bool_pair(ctx: &mut Ctx, a: bool, b: bool) -> Value {
    let bool_ty = ctx.arena.boolean();
    let pair_ty = ctx.arena.intern(Type::array(2, bool_ty));
    Value::Array(Aggregate::new(
        pair_ty,
        vec![
            Value::Primitive(Primitive::boolean(ctx.arena, a)),
            Value::Primitive(Primitive::boolean(ctx.arena, b)),
        ],
    ))
}

/// Mutable access to the acceleration-structure value an id refers to.
fn with_accel_mut<T>(
    ctx: &mut Ctx,
    view: ViewHandle,
    id: u32,
    f: impl FnOnce(&mut Ctx, &mut AccelStruct) -> Result<T>,
) -> Result<T> {
    let target = resolve_pointer(ctx, view, id)?;
    with_pointee_mut(ctx, view, &target, |ctx, val| match val {
        Value::AccelStruct(accel) => f(ctx, accel),
        _ => Err(anyhow!("%{} is not an acceleration structure", id)),
    })
}

fn enforce_coop_sizes(
    ctx: &Ctx,
    value: &mut Value,
    invocation: u32,
    num_invocations: u32,
) -> Result<()> {
    match value {
        Value::CoopMatrix(mat) => mat.enforce_size(ctx.arena, invocation, num_invocations),
        Value::Array(agg) | Value::Struct(agg) => {
            for el in agg.elements_mut() {
                enforce_coop_sizes(ctx, el, invocation, num_invocations)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Execute one instruction for one invocation.
pub fn execute(
    ctx: &mut Ctx,
    insts: &[Instruction],
    stacks: &mut Vec<Vec<Frame>>,
    invocation: usize,
    env: &ExecEnv,
) -> Result<bool> {
    let num_invocations = stacks.len() as u32;
    let (pc, view) = {
        let frame = stacks[invocation]
            .last()
            .ok_or_else(|| anyhow!("invocation has no active frame"))?;
        (frame.pc(), frame.view())
    };
    let inst = &insts[pc];
    let op = inst.op();

    let mut inc_pc = true;
    let mut blocked = false;
    let result_at = if inst.has_result() {
        ctx.mgr.check_ref(inst.result_id())?
    } else {
        0
    };

    match op {
        // No semantic value; kept only for predictability.
        Op::Nop | Op::Line | Op::NoLine | Op::ModuleProcessed => {}
        Op::Function | Op::MemoryBarrier | Op::LoopMerge | Op::SelectionMerge => {}

        Op::FunctionParameter => {
            // Parameters get a weak copy of the data passed in, so writes
            // through pointer parameters stick after the call returns.
            let arg = stacks[invocation]
                .last_mut()
                .expect("frame checked above")
                .take_arg()?;
            ctx.set(view, result_at, arg);
            inc_pc = false;
        }
        Op::FunctionEnd => bail!("missing return before function end"),
        Op::FunctionCall => {
            let func = ctx.get_function(view, inst, 2)?;
            let mut args = Vec::new();
            for i in 3..inst.operands().len() {
                let id = ctx.ref_id(inst, i)?;
                args.push(ctx.mgr.get(view, id)?.clone());
            }
            // A void return passes slot 0 so nothing gets written back.
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let ret_at = if ctx.arena.get(ret_ty).base() == TypeBase::Void {
                0
            } else {
                result_at
            };
            let callee_view = ctx.mgr.make_view(Some(view));
            let accel = stacks[invocation].last().map(|f| f.from_accel_id()).unwrap_or(0);
            stacks[invocation].push(
                Frame::new(func.location(), args, ret_at, callee_view).with_accel(accel),
            );
            inc_pc = false;
        }

        Op::Variable => {
            // Already materialised in the static pass; transfer threaded
            // storage down to this invocation and apply any initializer.
            let var_rc = ctx
                .mgr
                .get(view, result_at)?
                .as_variable()
                .ok_or_else(|| anyhow!("%{} is not a variable", result_at))?;
            let threaded = var_rc.borrow().is_threaded();
            let var_rc = if threaded {
                let copy = var_rc.borrow().clone();
                let data = Data::variable(copy);
                let rc = data.as_variable().expect("just built");
                ctx.set(view, result_at, data);
                rc
            } else {
                var_rc
            };
            {
                let mut var = var_rc.borrow_mut();
                enforce_coop_sizes(ctx, var.value_mut(), invocation as u32, num_invocations)?;
            }
            if inst.operands().len() > 3 {
                let default = ctx.get_value(view, inst, 3)?;
                var_rc.borrow_mut().set_value(&default, ctx.arena)?;
            }
        }

        Op::Load => {
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let target = resolve_pointer(ctx, view, ctx.ref_id(inst, 2)?)?;
            let from = read_pointee(ctx, view, &target)?;
            let value = match from {
                // Images and samplers share their texels rather than copy.
                img @ Value::Image(_) | img @ Value::Sampler(_) => img,
                from => {
                    let mut out = Value::construct(ctx.arena, ret_ty)?;
                    out.copy_from(&from, ctx.arena)?;
                    out
                }
            };
            ctx.set(view, result_at, Data::Value(value));
        }
        Op::Store => {
            let value = ctx.get_value(view, inst, 1)?;
            let target = resolve_pointer(ctx, view, ctx.ref_id(inst, 0)?)?;
            with_pointee_mut(ctx, view, &target, |ctx, dst| dst.copy_from(&value, ctx.arena))?;
        }
        Op::ImageWrite => {
            let image = match ctx.get_value(view, inst, 0)? {
                Value::Image(img) => img,
                _ => bail!("the first operand of OpImageWrite must be an image"),
            };
            let coords = ctx.get_value(view, inst, 1)?;
            let texel = ctx.get_value(view, inst, 2)?;
            let (x, y, z) = {
                let scalars = math::extract_f32s(ctx.arena, &coords).ok();
                match scalars {
                    Some(f) => {
                        let to_int = |v: Option<&f32>| -> Result<u32> {
                            match v {
                                None => Ok(0),
                                Some(x) if x.fract() == 0.0 => Ok(*x as u32),
                                _ => bail!("unsupported float coordinates for image write"),
                            }
                        };
                        (to_int(f.first())?, to_int(f.get(1))?, to_int(f.get(2))?)
                    }
                    None => bail!("could not read image write coordinates"),
                }
            };
            let parts: Vec<Value> = match texel {
                Value::Array(agg) => agg.elements().to_vec(),
                other => vec![other],
            };
            image.write(x, y, z, &parts)?;
        }

        Op::ControlBarrier => {
            blocked = true;
        }

        Op::Phi => {
            let last_label = stacks[invocation].last().expect("frame checked").last_label();
            let mut picked = None;
            let mut i = 3;
            while i < inst.operands().len() {
                let block = ctx.get_value(view, inst, i)?;
                if block.as_primitive()?.u32_val() == last_label {
                    picked = Some(ctx.get_value(view, inst, i - 1)?);
                    break;
                }
                i += 2;
            }
            let src =
                picked.ok_or_else(|| anyhow!("phi encountered without a label for the last block"))?;
            // Clone for data safety: the result must not alias any source.
            let ret_ty = ctx.get_type(view, inst, 0)?;
            let mut out = Value::construct(ctx.arena, ret_ty)?;
            out.copy_from(&src, ctx.arena)?;
            ctx.set(view, result_at, Data::Value(out));
        }
        Op::Label => {
            let label = ctx.get_value(view, inst, 0)?.as_primitive()?.u32_val();
            stacks[invocation].last_mut().expect("frame checked").set_label(label);
        }
        Op::Branch => {
            let dst = ctx.get_value(view, inst, 0)?.as_primitive()?.u32_val();
            stacks[invocation].last_mut().expect("frame checked").set_pc(dst as usize)?;
            inc_pc = false;
        }
        Op::BranchConditional => {
            let cond = ctx.get_value(view, inst, 0)?.as_primitive()?.bool_val();
            let dst = ctx
                .get_value(view, inst, if cond { 1 } else { 2 })?
                .as_primitive()?
                .u32_val();
            stacks[invocation].last_mut().expect("frame checked").set_pc(dst as usize)?;
            inc_pc = false;
        }
        Op::Switch => {
            let selector = ctx.get_value(view, inst, 0)?.as_primitive()?.i32_val();
            let mut target = 1; // default label
            let mut i = 2;
            while i + 1 < inst.operands().len() {
                let literal = match inst.operand(i)? {
                    Token::Int(x) => *x,
                    other => other.as_i32()?,
                };
                if literal == selector {
                    target = i + 1;
                    break;
                }
                i += 2;
            }
            let dst = ctx.get_value(view, inst, target)?.as_primitive()?.u32_val();
            stacks[invocation].last_mut().expect("frame checked").set_pc(dst as usize)?;
            inc_pc = false;
        }
        Op::Kill | Op::TerminateInvocation => {
            terminate_invocation(ctx, &mut stacks[invocation]);
            inc_pc = false;
        }
        Op::Return => {
            if stacks[invocation].last().expect("frame checked").has_return() {
                bail!("missing value for function return");
            }
            inc_pc = pop_frame(ctx, &mut stacks[invocation]);
        }
        Op::ReturnValue => {
            let frame_ret = stacks[invocation].last().expect("frame checked").return_at();
            if frame_ret == 0 {
                bail!("void function tried to return a value");
            }
            // The read is already a clone: the return slot may feed an
            // argument of another call of the same function and must not
            // alias any source operand.
            let out = ctx.get_value(view, inst, 0)?;
            inc_pc = pop_frame(ctx, &mut stacks[invocation]);
            let caller_view = stacks[invocation]
                .last()
                .map(|f| f.view())
                .unwrap_or_else(|| ctx.mgr.global());
            ctx.set(caller_view, frame_ret, Data::Value(out));
        }
        Op::Unreachable => bail!("unreachable code path executed"),

        Op::CooperativeMatrixLoadKHR => {
            coop_matrix_load(ctx, view, inst, invocation as u32, num_invocations, result_at)?;
        }
        Op::CooperativeMatrixStoreKHR => {
            coop_matrix_store(ctx, view, inst, invocation as u32, num_invocations)?;
        }
        Op::CooperativeMatrixMulAddKHR => {
            coop_matrix_mul_add(
                ctx,
                insts,
                stacks,
                invocation,
                view,
                inst,
                result_at,
            )?;
        }
        Op::CooperativeMatrixLengthKHR => {
            let mat_ty = ctx.get_type(view, inst, 2)?;
            let total = ctx.arena.get(mat_ty).size();
            let (beg, fin) =
                CoopMatrix::slice_range(total, invocation as u32, num_invocations);
            let out = Value::Primitive(Primitive::uint(ctx.arena, fin - beg));
            ctx.set(view, result_at, Data::Value(out));
        }

        Op::TraceRayKHR => {
            inc_pc = trace_ray(ctx, stacks, invocation, view, inst, env)?;
        }
        Op::ExecuteCallableKHR => {
            let frame = stacks[invocation].last_mut().expect("frame checked");
            if !frame.is_callable_return() {
                let index = ctx.get_value(view, inst, 0)?.as_primitive()?.u32_val();
                let callable = ctx
                    .mgr
                    .get(view, ctx.ref_id(inst, 1)?)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("callable data must be a variable"))?;
                let value = callable.borrow().value().clone();
                let accel = frame.from_accel_id();
                frame.trigger_callable(index, value, accel);
                // Return to this instruction after exit to clean up.
                inc_pc = false;
            } else {
                let result = frame
                    .rt
                    .result
                    .take()
                    .ok_or_else(|| anyhow!("callable returned without a result"))?;
                if let Some(stale) = frame.disable_raytrace() {
                    ctx.mgr.destroy_view(stale);
                }
                let callable = ctx
                    .mgr
                    .get(view, ctx.ref_id(inst, 1)?)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("callable data must be a variable"))?;
                callable.borrow_mut().set_value(&result, ctx.arena)?;
            }
        }
        Op::IgnoreIntersectionKHR | Op::TerminateRayKHR => {
            // Both pass a verdict up to the any-hit launcher; they differ
            // only in which field flips.
            let field = if op == Op::IgnoreIntersectionKHR { 0 } else { 1 };
            if let Some(at) = launching_frame(&stacks[invocation], RtTrigger::AnyHit)? {
                if let Some(Value::Array(arr)) = stacks[invocation][at].rt.result.as_mut() {
                    let flag = Primitive::boolean(ctx.arena, false);
                    arr.get_mut(field)?
                        .copy_from(&Value::Primitive(flag), ctx.arena)?;
                }
            }
            unwind_to_launcher(ctx, &mut stacks[invocation]);
            inc_pc = false;
        }
        Op::ReportIntersectionKHR => {
            inc_pc = report_intersection(ctx, stacks, invocation, view, inst, result_at)?;
        }

        Op::RayQueryInitializeKHR => {
            let accel = match ctx.get_value(view, inst, 1)? {
                Value::AccelStruct(accel) => accel,
                _ => bail!("ray query initialization needs an acceleration structure"),
            };
            let ray_flags = ctx.get_value(view, inst, 2)?.as_primitive()?.u32_val();
            let cull_mask = ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val();
            let origin = ctx.get_value(view, inst, 4)?.extract_vec("ray_origin", 3)?;
            let t_min = ctx.get_value(view, inst, 5)?.as_primitive()?.f32_val();
            let direction = ctx.get_value(view, inst, 6)?.extract_vec("ray_direction", 3)?;
            let t_max = ctx.get_value(view, inst, 7)?.as_primitive()?.f32_val();
            let target = resolve_pointer(ctx, view, ctx.ref_id(inst, 0)?)?;
            with_pointee_mut(ctx, view, &target, |_, val| match val {
                Value::RayQuery(query) => {
                    let mut accel = accel.clone();
                    // Ray queries never consult the shader binding table.
                    accel.init_trace(
                        ray_flags,
                        cull_mask & 0xFF,
                        [origin[0], origin[1], origin[2]],
                        [direction[0], direction[1], direction[2]],
                        t_min,
                        t_max,
                        false,
                        0,
                        0,
                        0,
                    );
                    query.set_accel_struct(accel);
                    Ok(())
                }
                _ => Err(anyhow!("operand is not a ray query")),
            })?;
        }
        Op::RayQueryTerminateKHR => {
            with_ray_query(ctx, view, inst, 0, |_, query| {
                query.accel_struct_mut()?.terminate();
                Ok(None::<()>)
            })?;
        }
        Op::RayQueryGenerateIntersectionKHR => {
            let t_hit = ctx.get_value(view, inst, 1)?.as_primitive()?.f32_val();
            with_ray_query(ctx, view, inst, 0, |_, query| {
                query.accel_struct_mut()?.generate_intersection(t_hit)?;
                Ok(None::<()>)
            })?;
        }
        Op::RayQueryConfirmIntersectionKHR => {
            with_ray_query(ctx, view, inst, 0, |_, query| {
                query.accel_struct_mut()?.confirm_intersection()?;
                Ok(None::<()>)
            })?;
        }
        Op::RayQueryProceedKHR => {
            let out = with_ray_query(ctx, view, inst, 2, |ctx, query| {
                let accel = query.accel_struct_mut()?;
                let status = accel.step_trace();
                if status == StepResult::Found
                    && accel.trace().ray_flags.terminate_on_first_hit()
                {
                    accel.terminate();
                }
                Ok(Some(Value::Primitive(Primitive::boolean(
                    ctx.arena,
                    status == StepResult::Found,
                ))))
            })?;
            if let Some(out) = out {
                ctx.set(view, result_at, Data::Value(out));
            }
        }
        op if is_ray_query_get(op) => {
            let out = ray_query_get(ctx, view, inst, op)?;
            ctx.set(view, result_at, Data::Value(out));
        }

        // Anything else behaves the same at build time and run time.
        _ => {
            if !make::make_result(ctx, view, insts, inst, pc, None)? {
                bail!("unsupported instruction execution ({:?})", op);
            }
        }
    }

    if inc_pc {
        stacks[invocation]
            .last_mut()
            .ok_or_else(|| anyhow!("invocation has no active frame"))?
            .inc_pc()?;
    }
    Ok(blocked)
}

fn is_ray_query_get(op: Op) -> bool {
    matches!(
        op,
        Op::RayQueryGetIntersectionTypeKHR
            | Op::RayQueryGetIntersectionTKHR
            | Op::RayQueryGetIntersectionInstanceCustomIndexKHR
            | Op::RayQueryGetIntersectionInstanceIdKHR
            | Op::RayQueryGetIntersectionInstanceShaderBindingTableRecordOffsetKHR
            | Op::RayQueryGetIntersectionGeometryIndexKHR
            | Op::RayQueryGetIntersectionPrimitiveIndexKHR
            | Op::RayQueryGetIntersectionBarycentricsKHR
            | Op::RayQueryGetIntersectionFrontFaceKHR
            | Op::RayQueryGetIntersectionCandidateAABBOpaqueKHR
            | Op::RayQueryGetIntersectionObjectRayDirectionKHR
            | Op::RayQueryGetIntersectionObjectRayOriginKHR
            | Op::RayQueryGetIntersectionObjectToWorldKHR
            | Op::RayQueryGetIntersectionWorldToObjectKHR
            | Op::RayQueryGetWorldRayDirectionKHR
            | Op::RayQueryGetWorldRayOriginKHR
    )
}

fn with_ray_query<T>(
    ctx: &mut Ctx,
    view: ViewHandle,
    inst: &Instruction,
    operand: usize,
    f: impl FnOnce(&mut Ctx, &mut spvsim_value::rt::accel::RayQuery) -> Result<T>,
) -> Result<T> {
    let target = resolve_pointer(ctx, view, ctx.ref_id(inst, operand)?)?;
    with_pointee_mut(ctx, view, &target, |ctx, val| match val {
        Value::RayQuery(query) => f(ctx, query),
        _ => Err(anyhow!("operand is not a ray query")),
    })
}

fn mat4x3_value(ctx: &Ctx, ret_ty: spvsim_value::TypeHandle, m: &[[f32; 4]; 3]) -> Result<Value> {
    // Externally a mat4x3 is 4 columns of vec3.
    let col_ty = ctx.arena.get(ret_ty).element()?;
    let mut cols = Vec::with_capacity(4);
    for j in 0..4 {
        let col = [m[0][j], m[1][j], m[2][j]];
        cols.push(math::vec_value(ctx.arena, col_ty, &col)?);
    }
    Ok(Value::Array(Aggregate::new(ret_ty, cols)))
}

fn ray_query_get(ctx: &mut Ctx, view: ViewHandle, inst: &Instruction, op: Op) -> Result<Value> {
    let ret_ty = ctx.get_type(view, inst, 0)?;
    let committed = if inst.operands().len() > 3 {
        ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val() == 1
    } else {
        false
    };
    with_ray_query(ctx, view, inst, 2, |ctx, query| {
        let accel = query.accel_struct()?;
        let out = match op {
            Op::RayQueryGetIntersectionTypeKHR => {
                let code = match (committed, accel.intersection_type(committed)) {
                    (true, IntersectionType::None) => 0,
                    (true, IntersectionType::Generated) => 1,
                    (true, _) => 2,
                    (false, IntersectionType::Aabb) => 1,
                    (false, _) => 0,
                };
                Value::Primitive(Primitive::uint(ctx.arena, code))
            }
            Op::RayQueryGetIntersectionTKHR => {
                Value::Primitive(Primitive::float(ctx.arena, accel.intersection_t(committed)?))
            }
            Op::RayQueryGetIntersectionInstanceCustomIndexKHR => Value::Primitive(Primitive::int(
                ctx.arena,
                accel.intersection_instance_custom_index(committed)?,
            )),
            Op::RayQueryGetIntersectionInstanceIdKHR => Value::Primitive(Primitive::int(
                ctx.arena,
                accel.intersection_instance_id(committed)?,
            )),
            Op::RayQueryGetIntersectionInstanceShaderBindingTableRecordOffsetKHR => {
                Value::Primitive(Primitive::uint(
                    ctx.arena,
                    accel.intersection_instance_sbt_offset(committed)?,
                ))
            }
            Op::RayQueryGetIntersectionGeometryIndexKHR => Value::Primitive(Primitive::int(
                ctx.arena,
                accel.intersection_geometry_index(committed)?,
            )),
            Op::RayQueryGetIntersectionPrimitiveIndexKHR => Value::Primitive(Primitive::int(
                ctx.arena,
                accel.intersection_primitive_index(committed)?,
            )),
            Op::RayQueryGetIntersectionBarycentricsKHR => {
                let bary = accel.intersection_barycentrics(committed)?;
                math::vec_value(ctx.arena, ret_ty, &bary)?
            }
            Op::RayQueryGetIntersectionFrontFaceKHR => Value::Primitive(Primitive::boolean(
                ctx.arena,
                accel.intersection_front_face(committed)?,
            )),
            Op::RayQueryGetIntersectionCandidateAABBOpaqueKHR => Value::Primitive(
                Primitive::boolean(ctx.arena, accel.intersection_candidate_aabb_opaque()?),
            ),
            Op::RayQueryGetIntersectionObjectRayDirectionKHR => {
                let v = accel.intersection_object_ray_direction(committed)?;
                math::vec_value(ctx.arena, ret_ty, &v)?
            }
            Op::RayQueryGetIntersectionObjectRayOriginKHR => {
                let v = accel.intersection_object_ray_origin(committed)?;
                math::vec_value(ctx.arena, ret_ty, &v)?
            }
            Op::RayQueryGetIntersectionObjectToWorldKHR => {
                let m = accel.intersection_object_to_world(committed)?;
                mat4x3_value(ctx, ret_ty, &m)?
            }
            Op::RayQueryGetIntersectionWorldToObjectKHR => {
                let m = accel.intersection_world_to_object(committed)?;
                mat4x3_value(ctx, ret_ty, &m)?
            }
            Op::RayQueryGetWorldRayDirectionKHR => {
                math::vec_value(ctx.arena, ret_ty, &accel.world_ray_direction())?
            }
            Op::RayQueryGetWorldRayOriginKHR => {
                math::vec_value(ctx.arena, ret_ty, &accel.world_ray_origin())?
            }
            _ => unreachable!("filtered by is_ray_query_get"),
        };
        Ok(out)
    })
}

fn coop_matrix_load(
    ctx: &mut Ctx,
    view: ViewHandle,
    inst: &Instruction,
    invocation: u32,
    num_invocations: u32,
    result_at: u32,
) -> Result<()> {
    let ret_ty = ctx.get_type(view, inst, 0)?;
    let pointer = match ctx.get_value(view, inst, 2)? {
        Value::Pointer(p) => p,
        _ => bail!("cooperative matrix load needs a pointer operand"),
    };
    let (trimmed, back_index) = pointer.decompose();
    let row_major = ctx.get_value(view, inst, 3)?.as_primitive()?.i32_val() == 0;

    let total = ctx.arena.get(ret_ty).size();
    let rows = ctx.arena.get(ret_ty).num_rows();
    let cols = total / rows;
    let (e_beg, e_fin) = CoopMatrix::slice_range(total, invocation, num_invocations);

    let mut stride = if row_major { cols } else { rows };
    if inst.operands().len() >= 5 {
        let given = ctx.get_value(view, inst, 4)?.as_primitive()?.u32_val();
        if given < stride {
            log::warn!(
                "given stride is less than the major axis length; load will read overlapping elements"
            );
        }
        stride = given;
    }

    let target = resolve_pointer(ctx, view, trimmed.head())?;
    let memory = read_pointee(ctx, view, &PointerTarget::from_parts(target, trimmed.indices()))?;

    let el_ty = ctx.arena.get(ret_ty).element()?;
    let mut elements = Vec::with_capacity((e_fin - e_beg) as usize);
    for i in e_beg..e_fin {
        let src = match &memory {
            // A scalar source replicates into every element.
            Value::Array(arr) => {
                let x = i % cols;
                let y = i / cols;
                let index = if row_major {
                    y * stride + x
                } else {
                    x * stride + y
                };
                arr.get((back_index + index) as usize)?.clone()
            }
            other => other.clone(),
        };
        let mut el = Value::construct(ctx.arena, el_ty)?;
        el.copy_from(&src, ctx.arena)?;
        elements.push(el);
    }
    let mut mat = CoopMatrix::new(ret_ty);
    mat.set_elements(elements);
    ctx.set(view, result_at, Data::Value(Value::CoopMatrix(mat)));
    Ok(())
}

fn coop_matrix_store(
    ctx: &mut Ctx,
    view: ViewHandle,
    inst: &Instruction,
    invocation: u32,
    num_invocations: u32,
) -> Result<()> {
    let pointer = match ctx.get_value(view, inst, 0)? {
        Value::Pointer(p) => p,
        _ => bail!("cooperative matrix store needs a pointer operand"),
    };
    let (trimmed, back_index) = pointer.decompose();
    let mut mat = match ctx.get_value(view, inst, 1)? {
        Value::CoopMatrix(mat) => mat,
        _ => bail!("cooperative matrix store needs a matrix operand"),
    };
    mat.enforce_size(ctx.arena, invocation, num_invocations)?;
    let row_major = ctx.get_value(view, inst, 2)?.as_primitive()?.i32_val() == 0;

    let total = mat.total(ctx.arena);
    let rows = mat.num_rows(ctx.arena);
    let cols = total / rows;
    let (e_beg, _) = CoopMatrix::slice_range(total, invocation, num_invocations);

    let mut stride = if row_major { cols } else { rows };
    if inst.operands().len() >= 4 {
        let given = ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val();
        if given < stride {
            log::warn!(
                "given stride is less than the major axis length; store will write overlapping elements"
            );
        }
        stride = given;
    }

    let target = resolve_pointer(ctx, view, trimmed.head())?;
    let target = PointerTarget::from_parts(target, trimmed.indices());
    with_pointee_mut(ctx, view, &target, |ctx, memory| {
        match memory {
            Value::Array(arr) => {
                for (j, el) in mat.elements().iter().enumerate() {
                    let i = e_beg + j as u32;
                    let x = i % cols;
                    let y = i / cols;
                    let index = if row_major {
                        y * stride + x
                    } else {
                        x * stride + y
                    };
                    arr.get_mut((back_index + index) as usize)?
                        .copy_from(el, ctx.arena)?;
                }
                Ok(())
            }
            other => {
                let last = mat
                    .elements()
                    .last()
                    .ok_or_else(|| anyhow!("cooperative matrix slice is empty"))?;
                other.copy_from(last, ctx.arena)
            }
        }
    })
}

fn coop_matrix_mul_add(
    ctx: &mut Ctx,
    _insts: &[Instruction],
    stacks: &mut Vec<Vec<Frame>>,
    invocation: usize,
    view: ViewHandle,
    inst: &Instruction,
    result_at: u32,
) -> Result<()> {
    let num_invocations = stacks.len() as u32;
    let ret_ty = ctx.get_type(view, inst, 0)?;

    // Gather the full logical A and B matrices by concatenating every
    // invocation's slice in order; the slices partition [0, N).
    let a_id = ctx.ref_id(inst, 2)?;
    let b_id = ctx.ref_id(inst, 3)?;
    let gather = |ctx: &Ctx, id: u32| -> Result<Vec<f32>> {
        let mut full = Vec::new();
        for stack in stacks.iter() {
            let peer_view = stack
                .last()
                .map(|f| f.view())
                .unwrap_or_else(|| ctx.mgr.global());
            let mat = ctx
                .mgr
                .get(peer_view, id)?
                .value()
                .ok_or_else(|| anyhow!("%{} is not a value in a peer invocation", id))?;
            match mat {
                Value::CoopMatrix(mat) => {
                    for el in mat.elements() {
                        full.push(math::scalar_of(ctx.arena, el)?.as_f32()?);
                    }
                }
                _ => bail!("%{} is not a cooperative matrix", id),
            }
        }
        Ok(full)
    };
    let a_full = gather(ctx, a_id)?;
    let b_full = gather(ctx, b_id)?;

    let mut cmat = match ctx.get_value(view, inst, 4)? {
        Value::CoopMatrix(mat) => mat,
        _ => bail!("cooperative matrix multiply-add needs matrix operands"),
    };
    cmat.enforce_size(ctx.arena, invocation as u32, num_invocations)?;

    let a_ty = {
        let a = ctx.get_value(view, inst, 2)?;
        a.ty()
    };
    let b_ty = {
        let b = ctx.get_value(view, inst, 3)?;
        b.ty()
    };
    let result_rows = ctx.arena.get(a_ty).num_rows();
    let shared_dim = ctx.arena.get(b_ty).num_rows();
    let total = ctx.arena.get(ret_ty).size();
    let result_cols = total / result_rows;

    let (e_beg, e_fin) = CoopMatrix::slice_range(total, invocation as u32, num_invocations);
    let el_ty = ctx.arena.get(ret_ty).element()?;
    if ctx.arena.get(el_ty).base() != TypeBase::Float {
        bail!("only float cooperative matrices are supported");
    }

    let mut elements = Vec::with_capacity((e_fin - e_beg) as usize);
    for i in e_beg..e_fin {
        let row = i / result_cols;
        let col = i % result_cols;
        let mut accum = 0.0f64;
        for j in 0..shared_dim {
            let a_el = a_full
                .get((row * shared_dim + j) as usize)
                .ok_or_else(|| anyhow!("cooperative matrix A index out of range"))?;
            let b_el = b_full
                .get((j * result_cols + col) as usize)
                .ok_or_else(|| anyhow!("cooperative matrix B index out of range"))?;
            accum += (*a_el as f64) * (*b_el as f64);
        }
        // The accumulator has the result's shape, so the matching element
        // lives at the same slice offset in this invocation.
        let c_el = math::scalar_of(ctx.arena, cmat.get((i - e_beg) as usize)?)?.as_f32()?;
        accum += c_el as f64;
        elements.push(Value::Primitive({
            let mut p = Primitive::float(ctx.arena, accum as f32);
            p.cast(el_ty);
            p
        }));
    }

    let mut out = CoopMatrix::new(ret_ty);
    out.set_elements(elements);
    ctx.set(view, result_at, Data::Value(Value::CoopMatrix(out)));
    Ok(())
}

impl PointerTarget {
    /// Extend a resolved target with further indices.
    fn from_parts(base: PointerTarget, extra: &[u32]) -> PointerTarget {
        match base {
            PointerTarget::Variable(var, mut path) => {
                path.extend_from_slice(extra);
                PointerTarget::Variable(var, path)
            }
            PointerTarget::Slot(id, mut path) => {
                path.extend_from_slice(extra);
                PointerTarget::Slot(id, path)
            }
        }
    }
}

/// The `OpTraceRayKHR` state machine. Returns whether to advance the pc.
fn trace_ray(
    ctx: &mut Ctx,
    stacks: &mut Vec<Vec<Frame>>,
    invocation: usize,
    view: ViewHandle,
    inst: &Instruction,
    env: &ExecEnv,
) -> Result<bool> {
    let accel_id = ctx.ref_id(inst, 0)?;
    let prev_stage = stacks[invocation].last().expect("frame checked").trigger();

    if prev_stage == RtTrigger::Miss || prev_stage == RtTrigger::Closest {
        // The substage has already written the payload into the result;
        // push it back out to the payload variable and resume.
        let frame = stacks[invocation].last_mut().expect("frame checked");
        let result = frame.rt.result.take();
        if let Some(stale) = frame.disable_raytrace() {
            ctx.mgr.destroy_view(stale);
        }
        if let Some(result) = result {
            let payload = ctx
                .mgr
                .get(view, ctx.ref_id(inst, 10)?)?
                .as_variable()
                .ok_or_else(|| anyhow!("ray payload must be a variable"))?;
            payload.borrow_mut().set_value(&result, ctx.arena)?;
        }
        return Ok(true);
    }

    let mut hit_attrib: Option<Value> = None;
    if prev_stage == RtTrigger::None {
        let ray_flags = ctx.get_value(view, inst, 1)?.as_primitive()?.u32_val();
        let cull_mask = ctx.get_value(view, inst, 2)?.as_primitive()?.u32_val();
        let offset_sbt = ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val();
        let stride_sbt = ctx.get_value(view, inst, 4)?.as_primitive()?.u32_val();
        let miss_index = ctx.get_value(view, inst, 5)?.as_primitive()?.u32_val();
        let origin = ctx.get_value(view, inst, 6)?.extract_vec("ray_origin", 3)?;
        let t_min = ctx.get_value(view, inst, 7)?.as_primitive()?.f32_val();
        let direction = ctx.get_value(view, inst, 8)?.extract_vec("ray_direction", 3)?;
        let t_max = ctx.get_value(view, inst, 9)?.as_primitive()?.f32_val();

        let use_sbt = env.use_sbt;
        with_accel_mut(ctx, view, accel_id, |_, accel| {
            accel.init_trace(
                ray_flags,
                cull_mask & 0xFF,
                [origin[0], origin[1], origin[2]],
                [direction[0], direction[1], direction[2]],
                t_min,
                t_max,
                use_sbt,
                offset_sbt & 0xF,
                stride_sbt & 0xF,
                miss_index & 0xFFFF,
            );
            Ok(())
        })?;
    } else {
        // Returned from an intersection or any-hit substage.
        let frame = stacks[invocation].last_mut().expect("frame checked");
        let valid_intersect = match prev_stage {
            RtTrigger::Intersection => {
                hit_attrib = frame.rt.hit_attribute.take();
                match frame.rt.result.take() {
                    Some(Value::Primitive(p)) => p.bool_val(),
                    _ => bail!("intersection substage returned a malformed result"),
                }
            }
            RtTrigger::AnyHit => match frame.rt.result.take() {
                // Index 1 (continue_search) only matters inside an
                // intersection shader, which we re-enter separately.
                Some(Value::Array(arr)) => arr.get(0)?.as_primitive()?.bool_val(),
                _ => bail!("any-hit substage returned a malformed result"),
            },
            _ => bail!("corrupted raytrace state on trace re-entry"),
        };
        if let Some(stale) = frame.disable_raytrace() {
            ctx.mgr.destroy_view(stale);
        }
        if valid_intersect {
            // Leave the trigger cleared but resume analysing this hit.
            let skip = true;
            return finish_trace(ctx, stacks, invocation, view, inst, env, accel_id, hit_attrib, skip);
        }
    }

    finish_trace(ctx, stacks, invocation, view, inst, env, accel_id, hit_attrib, false)
}

#[allow(clippy::too_many_arguments)]
fn finish_trace(
    ctx: &mut Ctx,
    stacks: &mut Vec<Vec<Frame>>,
    invocation: usize,
    view: ViewHandle,
    inst: &Instruction,
    env: &ExecEnv,
    accel_id: u32,
    hit_attrib: Option<Value>,
    skip_first: bool,
) -> Result<bool> {
    let status = with_accel_mut(ctx, view, accel_id, |_, accel| accel.trace_ray(skip_first))?;

    if status == StepResult::NeedsShader {
        // A candidate primitive needs a shader verdict before the trace
        // can continue.
        let (kind, index, result) = with_accel_mut(ctx, view, accel_id, |ctx, accel| {
            let trace = accel.trace();
            let cand = trace.candidate();
            let kind = if cand.kind == IntersectionType::Triangle {
                RtTrigger::AnyHit
            } else {
                RtTrigger::Intersection
            };
            let geom = cand.geometry_index.max(0) as u32;
            let index = accel.best_sbt_offset() + trace.offset_sbt + geom * trace.stride_sbt;
            let result = match kind {
                // Any-hit reports [valid_intersect, continue_search];
                // intersection reports a single validity bit.
                RtTrigger::AnyHit => bool_pair(ctx, true, true),
                _ => Value::Primitive(Primitive::boolean(ctx.arena, false)),
            };
            Ok((kind, index, result))
        })?;
        stacks[invocation]
            .last_mut()
            .expect("frame checked")
            .trigger_raytrace(kind, index, accel_id, result, hit_attrib);
        return Ok(false);
    }

    let payload = ctx
        .mgr
        .get(view, ctx.ref_id(inst, 10)?)?
        .as_variable()
        .ok_or_else(|| anyhow!("ray payload must be a variable"))?;

    let (use_sbt, has_committed, skip_closest, miss_index, committed_sbt_index, sect) =
        with_accel_mut(ctx, view, accel_id, |_, accel| {
            let trace = accel.trace();
            let committed = trace.committed().cloned();
            let index = accel.best_sbt_offset()
                + trace.offset_sbt
                + committed
                    .as_ref()
                    .map(|c| c.geometry_index.max(0) as u32)
                    .unwrap_or(0)
                    * trace.stride_sbt;
            Ok((
                trace.use_sbt,
                trace.has_committed(),
                trace.ray_flags.skip_closest_hit_shader(),
                trace.miss_index,
                index,
                committed,
            ))
        })?;

    if use_sbt {
        let frame = stacks[invocation].last_mut().expect("frame checked");
        if has_committed {
            if !skip_closest {
                let value = payload.borrow().value().clone();
                frame.trigger_raytrace(
                    RtTrigger::Closest,
                    committed_sbt_index,
                    accel_id,
                    value,
                    hit_attrib,
                );
                return Ok(false);
            }
        } else {
            // The hit attribute is not needed to call the miss shader.
            let value = payload.borrow().value().clone();
            frame.trigger_raytrace(RtTrigger::Miss, miss_index, accel_id, value, None);
            return Ok(false);
        }
    }

    // No shader binding table (or the closest hit was skipped): fill the
    // payload with the default layout {hitT, geometryIndex, primitiveIndex,
    // hitKind}, walked depth-first over the payload aggregate.
    fill_default_payload(ctx, &payload, sect.as_ref())?;
    let frame = stacks[invocation].last_mut().expect("frame checked");
    if let Some(stale) = frame.disable_raytrace() {
        ctx.mgr.destroy_view(stale);
    }
    Ok(true)
}

fn fill_default_payload(
    ctx: &mut Ctx,
    payload: &Rc<RefCell<Variable>>,
    sect: Option<&spvsim_value::rt::accel::Intersection>,
) -> Result<()> {
    let hit_t = sect.map(|s| s.hit_t).unwrap_or(f32::MAX);
    let geometry = sect.map(|s| s.geometry_index.max(0) as u32).unwrap_or(0);
    let primitive = sect.map(|s| s.primitive_index.max(0) as u32).unwrap_or(0);
    let hit_kind = sect.map(|s| s.hit_kind).unwrap_or(0);
    let is_hit = sect.map(|s| s.is_valid_hit()).unwrap_or(false);
    let front = sect
        .map(|s| s.hit_kind == spvsim_value::rt::accel::HIT_KIND_FRONT_FACING_TRIANGLE)
        .unwrap_or(false);

    let mut var = payload.borrow_mut();
    let mut frontier = vec![var.value_mut()];
    let mut flat: Vec<&mut Value> = Vec::new();
    while let Some(at) = frontier.pop() {
        match at {
            Value::Array(agg) | Value::Struct(agg) => {
                // Reverse push so the stack reads out in order.
                for el in agg.elements_mut().iter_mut().rev() {
                    frontier.push(el);
                }
            }
            Value::Primitive(_) => flat.push(at),
            other => bail!(
                "cannot fill a payload containing {:?}",
                ctx.arena.get(other.ty()).base()
            ),
        }
    }

    for (idx, slot) in flat.into_iter().enumerate() {
        let prim = slot.as_primitive_mut()?;
        let base = ctx.arena.get(prim.ty()).base();
        match idx {
            0 => match base {
                TypeBase::Float => prim.copy_from(&Primitive::float(ctx.arena, hit_t), ctx.arena)?,
                TypeBase::Bool => {
                    prim.copy_from(&Primitive::boolean(ctx.arena, is_hit), ctx.arena)?
                }
                _ => prim.copy_reinterp(&Primitive::float(ctx.arena, hit_t)),
            },
            1 => prim.copy_from(&Primitive::uint(ctx.arena, geometry), ctx.arena)?,
            2 => prim.copy_from(&Primitive::uint(ctx.arena, primitive), ctx.arena)?,
            3 => match base {
                TypeBase::Bool => {
                    prim.copy_from(&Primitive::boolean(ctx.arena, front), ctx.arena)?
                }
                _ => prim.copy_from(&Primitive::uint(ctx.arena, hit_kind), ctx.arena)?,
            },
            _ => match base {
                TypeBase::Bool => {
                    prim.copy_from(&Primitive::boolean(ctx.arena, false), ctx.arena)?
                }
                _ => prim.copy_from(&Primitive::uint(ctx.arena, 0), ctx.arena)?,
            },
        }
    }
    Ok(())
}

/// The `OpReportIntersectionKHR` handler. Returns whether to advance the
/// pc.
fn report_intersection(
    ctx: &mut Ctx,
    stacks: &mut Vec<Vec<Frame>>,
    invocation: usize,
    view: ViewHandle,
    inst: &Instruction,
    result_at: u32,
) -> Result<bool> {
    let t_hit = ctx.get_value(view, inst, 2)?.as_primitive()?.f32_val();
    let prev_stage = stacks[invocation].last().expect("frame checked").trigger();
    let launch_at = launching_frame(&stacks[invocation], RtTrigger::Intersection)?;

    let mut valid_intersect = false;
    let mut continue_search = true;

    if prev_stage == RtTrigger::None {
        let mut t_min = 0.0f32;
        if let Some(at) = launch_at {
            let (launch_view, launch_accel, launch_index) = {
                let lf = &stacks[invocation][at];
                (lf.view(), lf.rt.accel_id, lf.rt.index)
            };
            let (t_min_got, candidate_opaque) =
                with_accel_mut(ctx, launch_view, launch_accel, |_, accel| {
                    let trace = accel.trace();
                    Ok((trace.ray_t_min, trace.candidate().is_opaque))
                })?;
            t_min = t_min_got;
            if !candidate_opaque {
                // Non-opaque geometry asks the any-hit shader first.
                let hit_attrib = stacks[invocation][at].rt.hit_attribute.clone();
                let result = bool_pair(ctx, true, true);
                stacks[invocation]
                    .last_mut()
                    .expect("frame checked")
                    .trigger_raytrace(
                        RtTrigger::AnyHit,
                        launch_index,
                        launch_accel,
                        result,
                        hit_attrib,
                    );
                return Ok(false);
            }
        }
        // Without an any-hit to consult, validity is the range check.
        valid_intersect = t_hit >= t_min;
    } else {
        let frame = stacks[invocation].last_mut().expect("frame checked");
        match frame.rt.result.take() {
            Some(Value::Array(arr)) => {
                valid_intersect = arr.get(0)?.as_primitive()?.bool_val();
                continue_search = arr.get(1)?.as_primitive()?.bool_val();
            }
            _ => bail!("any-hit substage returned a malformed result"),
        }
        if let Some(stale) = frame.disable_raytrace() {
            ctx.mgr.destroy_view(stale);
        }
    }

    if let Some(at) = launch_at {
        let (launch_view, launch_accel) = {
            let lf = &stacks[invocation][at];
            (lf.view(), lf.rt.accel_id)
        };
        if valid_intersect {
            let hit_kind = ctx.get_value(view, inst, 3)?.as_primitive()?.u32_val();
            with_accel_mut(ctx, launch_view, launch_accel, |_, accel| {
                let cand = accel.trace_mut().candidate_mut();
                cand.hit_kind = hit_kind;
                cand.hit_t = t_hit;
                Ok(())
            })?;
        }
        let verdict = Value::Primitive(Primitive::boolean(ctx.arena, valid_intersect));
        if let Some(result) = stacks[invocation][at].rt.result.as_mut() {
            result.copy_from(&verdict, ctx.arena)?;
        }
    }

    let ret_ty = ctx.get_type(view, inst, 0)?;
    let mut out = Value::construct(ctx.arena, ret_ty)?;
    out.copy_from(
        &Value::Primitive(Primitive::boolean(ctx.arena, valid_intersect)),
        ctx.arena,
    )?;
    ctx.set(view, result_at, Data::Value(out));

    if !continue_search {
        unwind_to_launcher(ctx, &mut stacks[invocation]);
        return Ok(false);
    }
    Ok(true)
}

/// Render an instruction for the verbose trace.
pub fn describe(inst: &Instruction) -> String {
    use std::fmt::Write as _;
    let mut out = format!("{:?}", inst.op());
    for token in inst.operands() {
        match token {
            Token::Ref(id) => {
                let _ = write!(out, " %{}", id);
            }
            Token::Const(x) | Token::Uint(x) => {
                let _ = write!(out, " {}", x);
            }
            Token::Int(x) => {
                let _ = write!(out, " {}", x);
            }
            Token::Float(x) => {
                let _ = write!(out, " {}", x);
            }
            Token::String(s) => {
                let _ = write!(out, " {:?}", s);
            }
        }
    }
    out
}

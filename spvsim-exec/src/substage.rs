//! Ray-tracing substages.
//!
//! A substage is another shader module sharing the program's instruction
//! list but rooted in its own global data view. Launching one duplicates
//! that view, binds the trace built-ins, payload and hit attribute into
//! it, and pushes a frame at the substage's entry.
use anyhow::bail;
use spirv::{BuiltIn, StorageClass};
use spvsim_value::data::ViewHandle;
use spvsim_value::rt::accel::AccelStruct;
use spvsim_value::value::{Primitive, Value};
use spvsim_value::TypeBase;

use crate::error::{anyhow, Result};
use crate::frame::RtTrigger;
use crate::make::Ctx;

/// Locations of the variables a substage launch must bind.
#[derive(Debug, Default)]
pub struct RayTraceSubstage {
    /// Entry location in the shared instruction list.
    pub entry: usize,
    /// The substage's own global view.
    pub data: ViewHandle,
    pub ins: Vec<u32>,
    pub outs: Vec<u32>,
    pub specs: Vec<u32>,

    // Built-in variables to populate at launch.
    pub world_ray_origin: Vec<u32>,
    pub world_ray_direction: Vec<u32>,
    pub ray_t_max: Vec<u32>,
    pub ray_t_min: Vec<u32>,
    pub instance_custom_index: Vec<u32>,
    pub geometry_index: Vec<u32>,
    pub hit_kind: Vec<u32>,

    /// The incoming payload (or callable data) variable, 0 if none.
    pub payload: u32,
    /// An acceleration-structure variable to seed with the launching one.
    pub accel_struct: u32,
    /// The hit attribute variable; at most one exists.
    pub hit_attribute: u32,
}

impl RayTraceSubstage {
    /// Note interface variables the launch machinery owns. Returns whether
    /// the variable was recognised (and should skip interface extraction).
    pub fn note_static_var(&mut self, ctx: &Ctx, id: u32) -> Result<bool> {
        let var = match ctx.mgr.get(self.data, id)?.as_variable() {
            Some(var) => var,
            None => return Ok(false),
        };
        let var = var.borrow();
        match var.built_in() {
            Some(BuiltIn::WorldRayOriginKHR) => {
                self.world_ray_origin.push(id);
                return Ok(true);
            }
            Some(BuiltIn::WorldRayDirectionKHR) => {
                self.world_ray_direction.push(id);
                return Ok(true);
            }
            Some(BuiltIn::RayTmaxKHR) => {
                self.ray_t_max.push(id);
                return Ok(true);
            }
            Some(BuiltIn::RayTminKHR) => {
                self.ray_t_min.push(id);
                return Ok(true);
            }
            Some(BuiltIn::InstanceCustomIndexKHR) => {
                self.instance_custom_index.push(id);
                return Ok(true);
            }
            Some(BuiltIn::RayGeometryIndexKHR) => {
                self.geometry_index.push(id);
                return Ok(true);
            }
            Some(BuiltIn::HitKindKHR) => {
                self.hit_kind.push(id);
                return Ok(true);
            }
            _ => {}
        }

        if ctx.arena.get(var.value().ty()).base() == TypeBase::AccelStruct {
            self.accel_struct = id;
            return Ok(true);
        }
        match var.storage_class() {
            StorageClass::IncomingRayPayloadKHR | StorageClass::IncomingCallableDataKHR => {
                self.payload = id;
                Ok(true)
            }
            StorageClass::HitAttributeKHR => {
                self.hit_attribute = id;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Bind everything except the hit attribute into the duplicated view.
    pub fn set_up_inputs(
        &self,
        ctx: &mut Ctx,
        view: ViewHandle,
        accel: Option<&AccelStruct>,
        payload: Option<&Value>,
        instance_custom_index: i32,
        hit_kind: u32,
    ) -> Result<()> {
        let need_accel = |what: &str| -> Result<&AccelStruct> {
            accel.ok_or_else(|| {
                anyhow!(
                    "cannot set up the {} variable without an acceleration struct in the frame",
                    what
                )
            })
        };

        let copy_scalar = |ctx: &Ctx, locs: &[u32], val: &Value| -> Result<()> {
            for &loc in locs {
                let var = ctx
                    .mgr
                    .get(view, loc)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("%{} is not a variable", loc))?;
                var.borrow_mut().set_value(val, ctx.arena)?;
            }
            Ok(())
        };
        let copy_vec3 = |ctx: &Ctx, locs: &[u32], v: [f32; 3]| -> Result<()> {
            for &loc in locs {
                let var = ctx
                    .mgr
                    .get(view, loc)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("%{} is not a variable", loc))?;
                let mut var = var.borrow_mut();
                let arr = var.value_mut().as_aggregate_mut()?;
                for (i, &x) in v.iter().enumerate() {
                    arr.get_mut(i)?
                        .copy_from(&Value::Primitive(Primitive::float(ctx.arena, x)), ctx.arena)?;
                }
            }
            Ok(())
        };

        if !self.world_ray_origin.is_empty() {
            let accel = need_accel("world ray origin")?;
            copy_vec3(ctx, &self.world_ray_origin, accel.world_ray_origin())?;
        }
        if !self.world_ray_direction.is_empty() {
            let accel = need_accel("world ray direction")?;
            copy_vec3(ctx, &self.world_ray_direction, accel.world_ray_direction())?;
        }
        if !self.ray_t_max.is_empty() {
            let accel = need_accel("ray t maximum")?;
            let tmax = Value::Primitive(Primitive::float(ctx.arena, accel.trace().ray_t_max));
            copy_scalar(ctx, &self.ray_t_max, &tmax)?;
        }
        if !self.ray_t_min.is_empty() {
            let accel = need_accel("ray t minimum")?;
            let tmin = Value::Primitive(Primitive::float(ctx.arena, accel.trace().ray_t_min));
            copy_scalar(ctx, &self.ray_t_min, &tmin)?;
        }
        if !self.geometry_index.is_empty() {
            let accel = need_accel("geometry index")?;
            let sect = accel.trace().best();
            let geom = Value::Primitive(Primitive::uint(
                ctx.arena,
                sect.geometry_index.max(0) as u32,
            ));
            copy_scalar(ctx, &self.geometry_index, &geom)?;
        }
        if !self.hit_kind.is_empty() {
            let kind = Value::Primitive(Primitive::uint(ctx.arena, hit_kind));
            copy_scalar(ctx, &self.hit_kind, &kind)?;
        }
        let custom = Value::Primitive(Primitive::uint(
            ctx.arena,
            instance_custom_index.max(0) as u32,
        ));
        copy_scalar(ctx, &self.instance_custom_index, &custom)?;

        if self.accel_struct != 0 {
            let accel = need_accel("acceleration struct")?.clone();
            let var = ctx
                .mgr
                .get(view, self.accel_struct)?
                .as_variable()
                .ok_or_else(|| anyhow!("%{} is not a variable", self.accel_struct))?;
            var.borrow_mut()
                .set_value(&Value::AccelStruct(accel), ctx.arena)?;
        }
        if self.payload != 0 {
            if let Some(payload) = payload {
                let var = ctx
                    .mgr
                    .get(view, self.payload)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("%{} is not a variable", self.payload))?;
                var.borrow_mut().set_value(payload, ctx.arena).map_err(|_| {
                    anyhow!("cannot invoke a raytracing substage with an incorrect payload type")
                })?;
            }
        }
        Ok(())
    }

    /// Bind the hit attribute. One of four things happens: it is created
    /// fresh (intersection), carried over from a previous stage, built
    /// from the candidate barycentrics (triangle hits), or not needed at
    /// all. Returns the created attribute for the launcher to hold.
    pub fn set_up_hit_attribute(
        &self,
        ctx: &mut Ctx,
        view: ViewHandle,
        stage: RtTrigger,
        barycentrics: [f32; 2],
        carried: Option<&Value>,
    ) -> Result<Option<Value>> {
        if self.hit_attribute == 0 {
            return Ok(None);
        }
        let var = ctx
            .mgr
            .get(view, self.hit_attribute)?
            .as_variable()
            .ok_or_else(|| anyhow!("%{} is not a variable", self.hit_attribute))?;

        match carried {
            Some(attr) => {
                var.borrow_mut().set_value(attr, ctx.arena).map_err(|_| {
                    anyhow!("cannot invoke a raytracing substage with an incorrect hit attribute type")
                })?;
                Ok(None)
            }
            None if stage == RtTrigger::Intersection => {
                // The intersection shader writes it; hand the launcher a
                // blank one to collect into.
                let ty = var.borrow().value().ty();
                Ok(Some(Value::construct(ctx.arena, ty)?))
            }
            None => {
                let mut var = var.borrow_mut();
                if let Ok(arr) = var.value_mut().as_aggregate_mut() {
                    // Two is the expected barycentric size; three is a
                    // common mistake we accept.
                    if arr.len() == 2 || arr.len() == 3 {
                        for (i, &x) in barycentrics.iter().enumerate() {
                            arr.get_mut(i)?.copy_from(
                                &Value::Primitive(Primitive::float(ctx.arena, x)),
                                ctx.arena,
                            )?;
                        }
                        return Ok(None);
                    }
                }
                bail!("raytracing substage launch is missing a non-barycentric hit attribute")
            }
        }
    }

    /// Save the substage's results back for the launcher: the payload into
    /// the trigger result slot and, for intersection stages, the hit
    /// attribute.
    pub fn clean_up(
        &self,
        ctx: &Ctx,
        view: ViewHandle,
        stage: RtTrigger,
        result: &mut Option<Value>,
        hit_attribute: &mut Option<Value>,
    ) -> Result<()> {
        // Any-hit and intersection results are verdict slots written by
        // OpIgnoreIntersection/OpReportIntersection, not by the payload.
        let payload_out = matches!(
            stage,
            RtTrigger::Closest | RtTrigger::Miss | RtTrigger::Callable
        );
        if payload_out && self.payload != 0 {
            if let Some(result) = result.as_mut() {
                let var = ctx
                    .mgr
                    .get(view, self.payload)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("%{} is not a variable", self.payload))?;
                result.copy_from(var.borrow().value(), ctx.arena)?;
            }
        }
        if stage == RtTrigger::Intersection && self.hit_attribute != 0 {
            if let Some(attr) = hit_attribute.as_mut() {
                let var = ctx
                    .mgr
                    .get(view, self.hit_attribute)?
                    .as_variable()
                    .ok_or_else(|| anyhow!("%{} is not a variable", self.hit_attribute))?;
                attr.copy_from(var.borrow().value(), ctx.arena)?;
            }
        }
        Ok(())
    }
}

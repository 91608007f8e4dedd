//! Per-invocation activation records.
use spvsim_value::{Data, Value, ViewHandle};

use crate::error::{bail, Result};

/// Which ray-tracing callback a frame currently has outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtTrigger {
    None,
    AnyHit,
    Closest,
    Intersection,
    Miss,
    Callable,
}

impl RtTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RtTrigger::None => "none",
            RtTrigger::AnyHit => "any_hit",
            RtTrigger::Closest => "closest_hit",
            RtTrigger::Intersection => "intersection",
            RtTrigger::Miss => "miss",
            RtTrigger::Callable => "callable",
        }
    }
}

/// Ray-trace suspension state of a frame.
#[derive(Debug)]
pub struct RtState {
    pub trigger: RtTrigger,
    /// Shader-binding-table record index of the outstanding callback.
    pub index: u32,
    /// Id of the acceleration-structure value driving the trace (0 if
    /// none); resolved against this frame's view on re-entry.
    pub accel_id: u32,
    /// Substage result slot. Used as the payload (closest hit, miss), the
    /// `valid_intersect` primitive (intersection), the
    /// `[valid, continue_search]` pair (any hit) or the callable data.
    pub result: Option<Value>,
    pub hit_attribute: Option<Value>,
    /// The substage's data view, handed over when the substage frame pops.
    pub data: Option<ViewHandle>,
    /// Whether an outstanding callable is on its way back.
    pub returning: bool,
}

impl Default for RtState {
    fn default() -> Self {
        RtState {
            trigger: RtTrigger::None,
            index: 0,
            accel_id: 0,
            result: None,
            hit_attribute: None,
            data: None,
            returning: false,
        }
    }
}

/// An activation record: program counter, label pair for phis, pending
/// call arguments, return slot, data view and ray-trace trigger state.
#[derive(Debug)]
pub struct Frame {
    pc: usize,
    cur_label: u32,
    last_label: u32,
    args: Vec<Data>,
    ret_at: u32,
    view: ViewHandle,
    /// Acceleration structure of the stage this frame runs for, if any.
    /// Callables launched from a hit stage inherit it for built-ins.
    from_accel_id: u32,
    arg_count: usize,
    first: bool,
    pub rt: RtState,
}

impl Frame {
    pub fn new(pc: usize, args: Vec<Data>, ret_at: u32, view: ViewHandle) -> Frame {
        Frame {
            pc,
            cur_label: 0,
            last_label: 0,
            args,
            ret_at,
            view,
            from_accel_id: 0,
            arg_count: 0,
            first: true,
            rt: RtState::default(),
        }
    }

    pub fn with_accel(mut self, accel_id: u32) -> Frame {
        self.from_accel_id = accel_id;
        self
    }

    pub fn pc(&self) -> usize {
        self.pc
    }
    pub fn view(&self) -> ViewHandle {
        self.view
    }
    pub fn take_view(&mut self) -> ViewHandle {
        self.view
    }
    pub fn from_accel_id(&self) -> u32 {
        self.from_accel_id
    }

    /// Pull the next pending call argument. Consuming an argument advances
    /// the program counter in place of the usual increment.
    pub fn take_arg(&mut self) -> Result<Data> {
        if self.arg_count >= self.args.len() {
            bail!("no more function arguments to use");
        }
        self.pc += 1;
        let arg = self.args[self.arg_count].clone();
        self.arg_count += 1;
        Ok(arg)
    }

    pub fn inc_pc(&mut self) -> Result<()> {
        if self.first {
            self.first = false;
        } else if self.arg_count < self.args.len() {
            bail!("unused function argument(s)");
        }
        self.pc += 1;
        Ok(())
    }

    pub fn set_pc(&mut self, pc: usize) -> Result<()> {
        if self.arg_count < self.args.len() {
            bail!("unused function argument(s)");
        }
        self.pc = pc;
        Ok(())
    }

    pub fn return_at(&self) -> u32 {
        self.ret_at
    }
    pub fn has_return(&self) -> bool {
        self.ret_at != 0
    }

    /// Record entry into a block. The previous label remains readable for
    /// phi resolution.
    pub fn set_label(&mut self, label: u32) {
        self.last_label = self.cur_label;
        self.cur_label = label;
    }
    pub fn last_label(&self) -> u32 {
        self.last_label
    }

    pub fn trigger(&self) -> RtTrigger {
        self.rt.trigger
    }

    /// Suspend this frame for a ray-tracing callback.
    pub fn trigger_raytrace(
        &mut self,
        trigger: RtTrigger,
        index: u32,
        accel_id: u32,
        result: Value,
        hit_attribute: Option<Value>,
    ) {
        self.rt.trigger = trigger;
        self.rt.index = index;
        self.rt.accel_id = accel_id;
        self.rt.result = Some(result);
        self.rt.hit_attribute = hit_attribute;
        self.rt.data = None;
        self.rt.returning = false;
    }

    /// Suspend this frame for a callable callback.
    pub fn trigger_callable(&mut self, index: u32, callable: Value, accel_id: u32) {
        self.rt.trigger = RtTrigger::Callable;
        self.rt.index = index;
        self.rt.accel_id = accel_id;
        self.rt.result = Some(callable);
        self.rt.hit_attribute = None;
        self.rt.data = None;
        self.rt.returning = false;
    }

    pub fn is_callable_return(&self) -> bool {
        self.rt.trigger == RtTrigger::Callable && self.rt.returning
    }
    pub fn prepare_return(&mut self) {
        debug_assert_eq!(self.rt.trigger, RtTrigger::Callable);
        self.rt.returning = true;
    }

    /// Clear the suspension state; returns the substage view for disposal.
    pub fn disable_raytrace(&mut self) -> Option<ViewHandle> {
        self.rt.trigger = RtTrigger::None;
        self.rt.index = 0;
        self.rt.accel_id = 0;
        self.rt.result = None;
        self.rt.hit_attribute = None;
        self.rt.returning = false;
        self.rt.data.take()
    }
}

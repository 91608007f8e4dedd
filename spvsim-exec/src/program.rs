//! The program orchestrator.
//!
//! Parses the module, runs the static pass, extracts the interface, binds
//! inputs, then drives one frame stack per invocation cooperatively until
//! every stack drains. Ray-tracing substages suspend their launching frame
//! and are scheduled here.
use anyhow::bail;
use fnv::FnvHashMap as HashMap;
use num_traits::FromPrimitive;
use spirv::{BuiltIn, ExecutionModel, Op, StorageClass};
use spvsim_parse::{decode_module, Instruction, SpirvBinary};
use spvsim_value::data::{Data, DataManager, ViewHandle};
use spvsim_value::ty::{TypeArena, TypeBase};
use spvsim_value::value::{Primitive, Value, ValueMap};

use crate::compare::{self, VarSelector};
use crate::deco::DecoQueue;
use crate::error::{anyhow, Result};
use crate::exec::{self, ExecEnv};
use crate::frame::{Frame, RtTrigger};
use crate::make::{self, Ctx};
use crate::sbt::{ShaderBindingTable, SBT_NAME};
use crate::substage::RayTraceSubstage;

/// Indices into the substage list for one hit record.
#[derive(Clone, Copy, Debug, Default)]
pub struct HitGroup {
    pub closest: Option<usize>,
    pub any: Option<usize>,
    pub intersection: Option<usize>,
}

/// Interface of one loaded module.
#[derive(Debug, Default)]
struct ModuleInterface {
    entry_inst: Option<usize>,
    ins: Vec<u32>,
    outs: Vec<u32>,
    specs: Vec<u32>,
}

/// Observer hook for the interactive debugger.
pub trait Inspector {
    /// Called before each instruction executes. Returning an error aborts
    /// the run.
    fn before_step(&mut self, state: &StepState, invocation: usize, pc: usize, desc: &str)
        -> Result<()>;
}

/// A read-only window over the run for the debugger.
pub struct StepState<'a> {
    arena: &'a TypeArena,
    mgr: &'a DataManager,
    view: ViewHandle,
    interface: Vec<u32>,
    depth: usize,
}

impl<'a> StepState<'a> {
    /// Render the named interface variable, if it exists.
    pub fn variable(&self, name: &str) -> Option<String> {
        let selector = VarSelector::new(name);
        for &id in &self.interface {
            if let Ok(data) = self.mgr.get(self.view, id) {
                if let Some(var) = data.as_variable() {
                    let var = var.borrow();
                    if selector.matches(&var) {
                        return Some(var.value().display(self.arena));
                    }
                }
            }
        }
        None
    }

    /// All interface variable names with their current values.
    pub fn variables(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for &id in &self.interface {
            if let Ok(data) = self.mgr.get(self.view, id) {
                if let Some(var) = data.as_variable() {
                    let var = var.borrow();
                    let name = if var.name().is_empty() {
                        compare::synthetic_name(&var)
                    } else {
                        compare::mangle(var.name())
                    };
                    out.push((name, var.value().display(self.arena)));
                }
            }
        }
        out
    }

    /// Call-stack depth of the current invocation.
    pub fn stack_depth(&self) -> usize {
        self.depth
    }
}

/// A parsed, linked and executable SPIR-V program.
pub struct Program {
    insts: Vec<Instruction>,
    /// Instruction index each loaded file starts at.
    breaks: Vec<(usize, String)>,
    arena: TypeArena,
    mgr: DataManager,

    entry_inst: usize,
    entry_fn: u32,
    exec_model: ExecutionModel,
    ins: Vec<u32>,
    outs: Vec<u32>,
    specs: Vec<u32>,
    /// Variables re-created per invocation (private storage and
    /// invocation-varying built-ins).
    thread_vars: Vec<u32>,

    substages: Vec<RayTraceSubstage>,
    misses: Vec<usize>,
    hits: Vec<HitGroup>,
    callables: Vec<usize>,
    use_sbt: bool,
    /// Shader files already decoded, so one module referenced from many
    /// records parses once.
    module_cache: HashMap<String, std::ops::Range<usize>>,
}

impl Program {
    pub fn new() -> Program {
        Program {
            insts: Vec::new(),
            breaks: Vec::new(),
            arena: TypeArena::new(),
            mgr: DataManager::new(),
            entry_inst: 0,
            entry_fn: 0,
            exec_model: ExecutionModel::GLCompute,
            ins: Vec::new(),
            outs: Vec::new(),
            specs: Vec::new(),
            thread_vars: Vec::new(),
            substages: Vec::new(),
            misses: Vec::new(),
            hits: Vec::new(),
            callables: Vec::new(),
            use_sbt: false,
            module_cache: HashMap::default(),
        }
    }

    pub fn arena(&self) -> &TypeArena {
        &self.arena
    }
    pub fn arena_mut(&mut self) -> &mut TypeArena {
        &mut self.arena
    }
    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }
    pub fn uses_sbt(&self) -> bool {
        self.use_sbt
    }
    pub fn exec_model(&self) -> ExecutionModel {
        self.exec_model
    }

    /// Parse the main module from its bytes.
    pub fn parse(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if !self.insts.is_empty() {
            bail!("the main module has already been parsed");
        }
        self.append_module(name, bytes)?;
        Ok(())
    }

    fn append_module(&mut self, name: &str, bytes: &[u8]) -> Result<std::ops::Range<usize>> {
        let bin = SpirvBinary::from_bytes(bytes)?;
        let header = bin.header()?;
        let start = self.insts.len();
        let mut decoded = decode_module(&bin)?;
        self.insts.append(&mut decoded);
        self.breaks.push((start, name.to_owned()));
        // One id space bound covers every module; views keep ids distinct.
        let bound = self.mgr.bound().max(header.bound);
        self.mgr.set_bound(bound);
        Ok(start..self.insts.len())
    }

    /// Run the static pass and extract the interface, then load any shader
    /// binding table named in the inputs.
    pub fn init(&mut self, provided: &ValueMap) -> Result<()> {
        let range = 0..self.insts.len();
        let global = self.mgr.global();
        let interface = self.init_module(global, range, provided, false, None)?;
        self.entry_inst = interface
            .entry_inst
            .ok_or_else(|| anyhow!("module has no entry point"))?;
        self.exec_model = entry_model(&self.insts[self.entry_inst])?;
        self.entry_fn = self.insts[self.entry_inst].ref_at(1)?;
        self.ins = interface.ins;
        self.outs = interface.outs;
        self.specs = interface.specs;
        self.collect_thread_vars()?;

        if let Some(sbt_value) = provided.get(SBT_NAME) {
            let table = ShaderBindingTable::parse(&self.arena, sbt_value)?;
            self.load_binding_table(table)?;
            self.use_sbt = true;
        }
        Ok(())
    }

    /// The file an instruction came from; None when only one module is
    /// loaded and the name would add nothing.
    fn file_of(&self, pc: usize) -> Option<&str> {
        if self.breaks.len() <= 1 {
            return None;
        }
        self.breaks
            .iter()
            .rev()
            .find(|(start, _)| *start <= pc)
            .map(|(_, name)| name.as_str())
    }

    fn collect_thread_vars(&mut self) -> Result<()> {
        let global = self.mgr.global();
        let mut thread_vars = Vec::new();
        for id in self.mgr.local_ids(global) {
            if let Some(var) = self.mgr.get(global, id)?.as_variable() {
                let var = var.borrow();
                let varying_builtin = matches!(
                    var.built_in(),
                    Some(BuiltIn::LocalInvocationId)
                        | Some(BuiltIn::LocalInvocationIndex)
                        | Some(BuiltIn::GlobalInvocationId)
                        | Some(BuiltIn::LaunchIdKHR)
                );
                if var.is_threaded() || varying_builtin {
                    thread_vars.push(id);
                }
            }
        }
        thread_vars.sort_unstable();
        self.thread_vars = thread_vars;
        Ok(())
    }

    /// Static pass over one module range rooted at `view`.
    fn init_module(
        &mut self,
        view: ViewHandle,
        range: std::ops::Range<usize>,
        provided: &ValueMap,
        lenient: bool,
        mut substage: Option<&mut RayTraceSubstage>,
    ) -> Result<ModuleInterface> {
        let mut queue = DecoQueue::default();
        let mut interface = ModuleInterface::default();

        // The entry declaration precedes the interface, so the execution
        // model is known before any variable classifies.
        for i in range.clone() {
            if self.insts[i].op() == Op::EntryPoint {
                interface.entry_inst = Some(i);
                break;
            }
        }
        let model = interface
            .entry_inst
            .map(|at| entry_model(&self.insts[at]))
            .transpose()?;

        let mut in_function = false;
        for i in range {
            let inst = &self.insts[i];
            let op = inst.op();
            if queue.queue(inst, i)? {
                continue;
            }

            let make_now = if in_function {
                matches!(op, Op::Function | Op::Label | Op::Variable)
            } else {
                inst.has_result()
            };
            match op {
                Op::Function => in_function = true,
                Op::FunctionEnd => in_function = false,
                _ => {}
            }
            if !make_now {
                continue;
            }

            let mut ctx = Ctx {
                arena: &mut self.arena,
                mgr: &mut self.mgr,
            };
            let insts = &self.insts;
            make::make_result(&mut ctx, view, insts, &self.insts[i], i, Some(&queue))
                .map_err(|e| anyhow!("at instruction {} ({:?}): {}", i, op, e))?;

            // Interface extraction.
            if matches!(
                op,
                Op::Variable
                    | Op::SpecConstant
                    | Op::SpecConstantTrue
                    | Op::SpecConstantFalse
                    | Op::SpecConstantComposite
            ) {
                let id = self.insts[i].result_id();
                if let Some(sub) = substage.as_deref_mut() {
                    let ctx = Ctx {
                        arena: &mut self.arena,
                        mgr: &mut self.mgr,
                    };
                    if sub.note_static_var(&ctx, id)? {
                        continue;
                    }
                }
                self.io_gen(view, id, model, provided, lenient, &mut interface)?;
            }
        }
        Ok(interface)
    }

    /// Sort one variable into the input/output/spec-constant lists by its
    /// storage class.
    fn io_gen(
        &mut self,
        view: ViewHandle,
        id: u32,
        model: Option<ExecutionModel>,
        provided: &ValueMap,
        lenient: bool,
        interface: &mut ModuleInterface,
    ) -> Result<()> {
        let var_rc = self
            .mgr
            .get(view, id)?
            .as_variable()
            .ok_or_else(|| anyhow!("%{} is not a variable", id))?;
        let (storage, spec_const, writable, name, is_image) = {
            let var = var_rc.borrow();
            (
                var.storage_class(),
                var.is_spec_const(),
                var.is_writable(),
                var.name().to_owned(),
                self.arena.get(var.value().ty()).base() == TypeBase::Image,
            )
        };

        use StorageClass as SC;
        match storage {
            SC::PushConstant if spec_const => {
                // Specialization constants read their value from the
                // provided inputs, defaulting when absent.
                if let Some(value) = provided.get(&name) {
                    var_rc
                        .borrow_mut()
                        .set_value(value, &self.arena)
                        .map_err(|e| anyhow!("input \"{}\": {}", name, e))?;
                }
                interface.specs.push(id);
            }
            SC::PushConstant => interface.ins.push(id),
            SC::UniformConstant => {
                if is_image && writable {
                    interface.outs.push(id);
                }
                interface.ins.push(id);
            }
            SC::Input | SC::ShaderRecordBufferKHR => interface.ins.push(id),
            SC::Uniform => interface.ins.push(id),
            SC::CrossWorkgroup
            | SC::StorageBuffer
            | SC::IncomingCallableDataKHR
            | SC::IncomingRayPayloadKHR => {
                interface.ins.push(id);
                if writable {
                    interface.outs.push(id);
                }
            }
            SC::Output | SC::CallableDataKHR | SC::RayPayloadKHR => interface.outs.push(id),
            SC::HitAttributeKHR => match model {
                Some(ExecutionModel::IntersectionKHR) => {
                    interface.ins.push(id);
                    interface.outs.push(id);
                }
                Some(ExecutionModel::AnyHitKHR) | Some(ExecutionModel::ClosestHitKHR) => {
                    interface.ins.push(id);
                }
                _ if lenient => {}
                _ => bail!("bad execution model using storage class HitAttributeKHR"),
            },
            // Private, Function and Workgroup storage never faces outward.
            _ => {}
        }
        Ok(())
    }

    /// Load each shader the table names and register its substage.
    fn load_binding_table(&mut self, table: ShaderBindingTable) -> Result<()> {
        for spec in &table.misses {
            let at = self.load_substage(&spec.path, ExecutionModel::MissKHR, &spec.record)?;
            self.misses.push(at);
        }
        for spec in &table.hits {
            let mut group = HitGroup::default();
            if let Some(path) = &spec.closest {
                group.closest =
                    Some(self.load_substage(path, ExecutionModel::ClosestHitKHR, &spec.record)?);
            }
            if let Some(path) = &spec.any {
                group.any =
                    Some(self.load_substage(path, ExecutionModel::AnyHitKHR, &spec.record)?);
            }
            if let Some(path) = &spec.intersection {
                group.intersection =
                    Some(self.load_substage(path, ExecutionModel::IntersectionKHR, &spec.record)?);
            }
            self.hits.push(group);
        }
        for spec in &table.callables {
            let at = self.load_substage(&spec.path, ExecutionModel::CallableKHR, &spec.record)?;
            self.callables.push(at);
        }
        Ok(())
    }

    fn load_substage(
        &mut self,
        path: &str,
        expected: ExecutionModel,
        record: &ValueMap,
    ) -> Result<usize> {
        let range = match self.module_cache.get(path) {
            Some(range) => range.clone(),
            None => {
                let bytes = std::fs::read(path)
                    .map_err(|e| anyhow!("could not open shader file \"{}\": {}", path, e))?;
                let range = self.append_module(path, &bytes)?;
                self.module_cache.insert(path.to_owned(), range.clone());
                range
            }
        };
        let view = self.mgr.make_view(None);

        let mut sub = RayTraceSubstage {
            data: view,
            ..Default::default()
        };
        // Substage inputs check leniently: built-ins fill in at launch.
        let interface = self.init_module(view, range, record, true, Some(&mut sub))?;
        let entry_inst = interface
            .entry_inst
            .ok_or_else(|| anyhow!("shader \"{}\" has no entry point", path))?;
        let model = entry_model(&self.insts[entry_inst])?;
        if model != expected {
            bail!(
                "shader \"{}\" is a {:?} stage where {:?} was expected",
                path,
                model,
                expected
            );
        }
        let entry_fn = self.insts[entry_inst].ref_at(1)?;
        let entry = self
            .mgr
            .get(view, entry_fn)?
            .as_function()
            .ok_or_else(|| anyhow!("shader \"{}\" is missing its entry function", path))?
            .location();
        sub.entry = entry;
        sub.ins = interface.ins;
        sub.outs = interface.outs;
        sub.specs = interface.specs;

        // Satisfy record-buffer inputs from the record values.
        self.bind_inputs(view, &sub.ins.clone(), record, true)?;

        self.substages.push(sub);
        Ok(self.substages.len() - 1)
    }

    /// Copy provided inputs into their matching variables. With `lenient`
    /// set, unknown inputs are ignored and missing inputs keep defaults.
    pub fn check_inputs(&mut self, provided: &ValueMap, lenient: bool) -> Result<()> {
        let ids: Vec<u32> = self.ins.iter().chain(self.specs.iter()).copied().collect();
        self.bind_inputs(self.mgr.global(), &ids, provided, lenient)
    }

    fn bind_inputs(
        &mut self,
        view: ViewHandle,
        ids: &[u32],
        provided: &ValueMap,
        lenient: bool,
    ) -> Result<()> {
        let mut used = vec![false; provided.len()];
        for &id in ids {
            let var_rc = match self.mgr.get(view, id)?.as_variable() {
                Some(var) => var,
                None => continue,
            };
            let built_in = var_rc.borrow().built_in().is_some();
            let mut found = false;
            for (at, (name, value)) in provided.iter().enumerate() {
                if name == SBT_NAME {
                    used[at] = true;
                    continue;
                }
                let matches = {
                    let var = var_rc.borrow();
                    VarSelector::new(name).matches(&var)
                };
                if matches {
                    var_rc
                        .borrow_mut()
                        .set_value(value, &self.arena)
                        .map_err(|e| anyhow!("input \"{}\": {}", name, e))?;
                    used[at] = true;
                    found = true;
                    break;
                }
            }
            if !found && !built_in && !lenient {
                let name = {
                    let var = var_rc.borrow();
                    if var.name().is_empty() {
                        compare::synthetic_name(&var)
                    } else {
                        var.name().to_owned()
                    }
                };
                bail!("missing program input \"{}\"", name);
            }
        }
        if !lenient {
            for (at, (name, _)) in provided.iter().enumerate() {
                if !used[at] && name != SBT_NAME {
                    bail!("input \"{}\" does not match any program input", name);
                }
            }
        }
        Ok(())
    }

    /// Externalisable map of the program's inputs, for templates.
    pub fn get_inputs(&mut self) -> Result<ValueMap> {
        let ids: Vec<u32> = self.ins.iter().chain(self.specs.iter()).copied().collect();
        self.collect_variables(&ids)
    }

    /// Externalisable map of the program's outputs.
    pub fn get_outputs(&mut self) -> Result<ValueMap> {
        let ids = self.outs.clone();
        self.collect_variables(&ids)
    }

    fn collect_variables(&mut self, ids: &[u32]) -> Result<ValueMap> {
        let global = self.mgr.global();
        let mut out = ValueMap::new();
        for &id in ids {
            let var_rc = match self.mgr.get(global, id)?.as_variable() {
                Some(var) => var,
                None => continue,
            };
            let (name, value, built_in) = {
                let var = var_rc.borrow();
                let name = if var.name().is_empty() {
                    compare::synthetic_name(&var)
                } else {
                    compare::mangle(var.name())
                };
                (name, var.value().clone(), var.built_in().is_some())
            };
            if built_in {
                continue;
            }
            let value = match value {
                Value::AccelStruct(accel) => accel.to_struct(&mut self.arena)?,
                Value::Image(image) => image.to_struct(&mut self.arena)?,
                other => other,
            };
            out.insert(name, value);
        }
        Ok(out)
    }

    /// Compare the outputs against expected values. Returns whether all
    /// matched and how many were compared.
    pub fn check_outputs(&mut self, checks: &ValueMap) -> Result<(bool, usize)> {
        let outputs = self.get_outputs()?;
        let mut all_ok = true;
        for (name, expected) in checks {
            match outputs.get(name) {
                Some(got) if got.equals(expected, &self.arena) => {}
                _ => all_ok = false,
            }
        }
        Ok((all_ok, checks.len()))
    }

    /// Execute the program to completion.
    pub fn execute(
        &mut self,
        verbose: bool,
        mut inspector: Option<&mut dyn Inspector>,
    ) -> Result<()> {
        let global = self.mgr.global();
        let entry = self
            .mgr
            .get(global, self.entry_fn)?
            .as_entry_point()
            .ok_or_else(|| anyhow!("entry function is not an entry point"))?
            .clone();
        let num_invocations = entry.num_invocations().max(1) as usize;
        let local_size = entry.local_size;
        let entry_loc = entry.func.location();

        // One frame stack per invocation, each with its own root view
        // holding the thread-local variables.
        let mut stacks: Vec<Vec<Frame>> = Vec::with_capacity(num_invocations);
        for invocation in 0..num_invocations {
            let root = self.mgr.make_view(Some(global));
            self.seed_thread_vars(root, invocation as u32, local_size)?;
            stacks.push(vec![Frame::new(entry_loc, Vec::new(), 0, root)]);
        }

        let env = ExecEnv {
            verbose,
            use_sbt: self.use_sbt,
        };
        let mut blocked = vec![false; num_invocations];
        loop {
            let mut alive = 0;
            let mut ran_any = false;
            for invocation in 0..num_invocations {
                if stacks[invocation].is_empty() {
                    continue;
                }
                alive += 1;
                if blocked[invocation] {
                    continue;
                }
                ran_any = true;

                self.pre_step(&mut stacks, invocation)?;
                if stacks[invocation].is_empty() {
                    continue;
                }

                let pc = stacks[invocation].last().expect("non-empty").pc();
                if pc >= self.insts.len() {
                    bail!("program counter ran off the end of the module");
                }
                if verbose || inspector.is_some() {
                    let desc = exec::describe(&self.insts[pc]);
                    if verbose {
                        if num_invocations > 1 {
                            println!("[{}] {}", invocation, desc);
                        } else {
                            println!("{}", desc);
                        }
                    }
                    if let Some(inspector) = inspector.as_deref_mut() {
                        let state = StepState {
                            arena: &self.arena,
                            mgr: &self.mgr,
                            view: stacks[invocation].last().expect("non-empty").view(),
                            interface: self
                                .ins
                                .iter()
                                .chain(self.outs.iter())
                                .chain(self.specs.iter())
                                .copied()
                                .collect(),
                            depth: stacks[invocation].len(),
                        };
                        inspector.before_step(&state, invocation, pc, &desc)?;
                    }
                }

                let mut ctx = Ctx {
                    arena: &mut self.arena,
                    mgr: &mut self.mgr,
                };
                let op = self.insts[pc].op();
                let got = exec::execute(&mut ctx, &self.insts, &mut stacks, invocation, &env)
                    .map_err(|e| match self.file_of(pc) {
                        Some(file) => {
                            anyhow!("{}: at instruction {} ({:?}): {}", file, pc, op, e)
                        }
                        None => anyhow!("at instruction {} ({:?}): {}", pc, op, e),
                    })?;
                blocked[invocation] = got;
            }

            if alive == 0 {
                break;
            }
            if !ran_any {
                // Every live invocation reached the barrier; release them
                // all at once.
                for flag in blocked.iter_mut() {
                    *flag = false;
                }
            }
        }
        Ok(())
    }

    /// Launch or complete a substage if the top frame asks for one.
    fn pre_step(&mut self, stacks: &mut [Vec<Frame>], invocation: usize) -> Result<()> {
        let needs = {
            let frame = stacks[invocation].last().expect("non-empty");
            frame.trigger() != RtTrigger::None
        };
        if !needs {
            return Ok(());
        }
        let launched = stacks[invocation]
            .last()
            .expect("non-empty")
            .rt
            .data
            .is_some();
        if !launched {
            self.launch_substage(stacks, invocation)
        } else {
            self.complete_substage(stacks, invocation)
        }
    }

    fn substage_for(&self, trigger: RtTrigger, index: u32) -> Result<usize> {
        let index = index as usize;
        let missing = || {
            anyhow!(
                "the shader binding table has no {} record at index {}",
                trigger.as_str(),
                index
            )
        };
        match trigger {
            RtTrigger::Miss => self.misses.get(index).copied().ok_or_else(missing),
            RtTrigger::Callable => self.callables.get(index).copied().ok_or_else(missing),
            RtTrigger::Closest => self
                .hits
                .get(index)
                .and_then(|g| g.closest)
                .ok_or_else(missing),
            RtTrigger::AnyHit => self.hits.get(index).and_then(|g| g.any).ok_or_else(missing),
            RtTrigger::Intersection => self
                .hits
                .get(index)
                .and_then(|g| g.intersection)
                .ok_or_else(missing),
            RtTrigger::None => Err(anyhow!("no substage to launch")),
        }
    }

    fn launch_substage(&mut self, stacks: &mut [Vec<Frame>], invocation: usize) -> Result<()> {
        let (trigger, index, accel_id, launcher_view, from_accel) = {
            let frame = stacks[invocation].last().expect("non-empty");
            (
                frame.trigger(),
                frame.rt.index,
                frame.rt.accel_id,
                frame.view(),
                frame.from_accel_id(),
            )
        };
        let sub_at = self.substage_for(trigger, index)?;

        // Read the trace context from the launching acceleration structure.
        let accel = if accel_id != 0 {
            let ctx = Ctx {
                arena: &mut self.arena,
                mgr: &mut self.mgr,
            };
            let target = exec::resolve_pointer(&ctx, launcher_view, accel_id)?;
            match exec::read_pointee(&ctx, launcher_view, &target)? {
                Value::AccelStruct(accel) => Some(accel),
                _ => None,
            }
        } else {
            None
        };
        let hit_stage = matches!(
            trigger,
            RtTrigger::Closest | RtTrigger::AnyHit | RtTrigger::Intersection
        );
        let (custom_index, hit_kind, barycentrics) = match &accel {
            Some(accel) if hit_stage => {
                let committed = trigger == RtTrigger::Closest && accel.trace().has_committed();
                (
                    accel
                        .intersection_instance_custom_index(committed)
                        .unwrap_or(-1),
                    accel.intersection_hit_kind(committed).unwrap_or(0),
                    accel.intersection_barycentrics(committed).unwrap_or([0.0, 0.0]),
                )
            }
            _ => (-1, 0, [0.0, 0.0]),
        };

        let dup = self.mgr.deep_clone_view(self.substages[sub_at].data);
        let payload = match trigger {
            RtTrigger::Closest | RtTrigger::Miss | RtTrigger::Callable => {
                stacks[invocation].last().expect("non-empty").rt.result.clone()
            }
            _ => None,
        };
        {
            let mut ctx = Ctx {
                arena: &mut self.arena,
                mgr: &mut self.mgr,
            };
            let sub = &self.substages[sub_at];
            sub.set_up_inputs(
                &mut ctx,
                dup,
                accel.as_ref(),
                payload.as_ref(),
                custom_index,
                hit_kind,
            )?;
            let carried = stacks[invocation]
                .last()
                .expect("non-empty")
                .rt
                .hit_attribute
                .clone();
            let created =
                sub.set_up_hit_attribute(&mut ctx, dup, trigger, barycentrics, carried.as_ref())?;
            if let Some(created) = created {
                stacks[invocation]
                    .last_mut()
                    .expect("non-empty")
                    .rt
                    .hit_attribute = Some(created);
            }
        }

        let entry = self.substages[sub_at].entry;
        stacks[invocation].last_mut().expect("non-empty").rt.data = Some(dup);
        let inherited = if accel_id != 0 { accel_id } else { from_accel };
        stacks[invocation].push(Frame::new(entry, Vec::new(), 0, dup).with_accel(inherited));
        Ok(())
    }

    /// The substage frame has popped; pull its results back into the
    /// launcher before the suspended instruction re-executes.
    fn complete_substage(&mut self, stacks: &mut [Vec<Frame>], invocation: usize) -> Result<()> {
        let (trigger, index, view) = {
            let frame = stacks[invocation].last().expect("non-empty");
            (
                frame.trigger(),
                frame.rt.index,
                frame.rt.data.expect("checked by pre_step"),
            )
        };
        let sub_at = self.substage_for(trigger, index)?;
        let ctx = Ctx {
            arena: &mut self.arena,
            mgr: &mut self.mgr,
        };
        let frame = stacks[invocation].last_mut().expect("non-empty");
        let mut result = frame.rt.result.take();
        let mut hit_attribute = frame.rt.hit_attribute.take();
        self.substages[sub_at].clean_up(&ctx, view, trigger, &mut result, &mut hit_attribute)?;
        frame.rt.result = result;
        frame.rt.hit_attribute = hit_attribute;
        Ok(())
    }

    /// Give this invocation private copies of thread-local variables and
    /// populate the invocation-varying built-ins.
    fn seed_thread_vars(
        &mut self,
        root: ViewHandle,
        invocation: u32,
        local_size: [u32; 3],
    ) -> Result<()> {
        let global = self.mgr.global();
        for &id in &self.thread_vars.clone() {
            if let Some(var) = self.mgr.get(global, id)?.as_variable() {
                let copy = var.borrow().clone();
                self.mgr.set(root, id, Data::variable(copy));
            }
        }

        let x = invocation % local_size[0];
        let y = (invocation / local_size[0]) % local_size[1];
        let z = invocation / (local_size[0] * local_size[1]);
        let ids: Vec<u32> = self.ins.clone();
        for id in ids {
            let var_rc = match self.mgr.get(root, id)?.as_variable() {
                Some(var) => var,
                None => continue,
            };
            let built_in = var_rc.borrow().built_in();
            let value = match built_in {
                Some(BuiltIn::LocalInvocationId)
                | Some(BuiltIn::GlobalInvocationId)
                | Some(BuiltIn::LaunchIdKHR) => Some(self.uvec3_value([x, y, z])?),
                Some(BuiltIn::LocalInvocationIndex) => Some(Value::Primitive(Primitive::uint(
                    &self.arena,
                    invocation,
                ))),
                Some(BuiltIn::WorkgroupSize) | Some(BuiltIn::LaunchSizeKHR) => {
                    Some(self.uvec3_value(local_size)?)
                }
                Some(BuiltIn::NumWorkgroups) => Some(self.uvec3_value([1, 1, 1])?),
                _ => None,
            };
            if let Some(value) = value {
                var_rc
                    .borrow_mut()
                    .set_value(&value, &self.arena)
                    .map_err(|e| anyhow!("cannot populate built-in: {}", e))?;
            }
        }
        Ok(())
    }

    fn uvec3_value(&mut self, v: [u32; 3]) -> Result<Value> {
        use spvsim_value::ty::Type;
        use spvsim_value::value::Aggregate;
        let u32_ty = self.arena.u32();
        let ty = self.arena.intern(Type::array(3, u32_ty));
        let elements = v
            .iter()
            .map(|&x| Value::Primitive(Primitive::uint(&self.arena, x)))
            .collect();
        Ok(Value::Array(Aggregate::new(ty, elements)))
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_model(inst: &Instruction) -> Result<ExecutionModel> {
    ExecutionModel::from_u32(inst.u32_at(0)?)
        .ok_or_else(|| anyhow!("invalid execution model in entry point"))
}

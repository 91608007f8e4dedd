//! Id-indexed data slots and the scoped views frames read through.
//!
//! Every SSA result id maps to a [`Data`]: a type, a variable, a function,
//! an entry point or a plain value. Views chain to a parent; a read walks
//! the chain until the id is found while writes land in the view they were
//! issued against. Variables are shared behind `Rc` so aliases across
//! frames (function parameters, pointer targets) observe writes in place.
use fnv::FnvHashMap as HashMap;
use spirv::{BuiltIn, StorageClass};
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{anyhow, bail, Result};
use crate::ty::{TypeArena, TypeBase, TypeHandle};
use crate::value::Value;

/// A module variable: a value wrapped with its interface metadata.
#[derive(Clone, Debug)]
pub struct Variable {
    value: Value,
    storage: StorageClass,
    name: String,
    built_in: Option<BuiltIn>,
    spec_const: bool,
    nonwritable: bool,
    binding: Option<u32>,
    descriptor_set: Option<u32>,
}

impl Variable {
    /// Create a variable from its (pointer) type, constructing the pointee.
    pub fn make(arena: &TypeArena, pointer_ty: TypeHandle, storage: StorageClass) -> Result<Variable> {
        let ty = arena.get(pointer_ty);
        if ty.base() != TypeBase::Pointer {
            bail!("cannot initialize a variable with a non-pointer type");
        }
        let value = Value::construct(arena, ty.pointee()?)?;
        Ok(Variable {
            value,
            storage,
            name: String::new(),
            built_in: None,
            spec_const: false,
            nonwritable: false,
            binding: None,
            descriptor_set: None,
        })
    }

    /// Specialization constants are treated as both a value and a variable.
    pub fn make_spec_const(value: Value) -> Variable {
        Variable {
            value,
            storage: StorageClass::PushConstant,
            name: String::new(),
            built_in: None,
            spec_const: true,
            nonwritable: false,
            binding: None,
            descriptor_set: None,
        }
    }

    pub fn storage_class(&self) -> StorageClass {
        self.storage
    }
    pub fn is_spec_const(&self) -> bool {
        self.spec_const
    }
    /// Private and Function storage is per-invocation.
    pub fn is_threaded(&self) -> bool {
        matches!(self.storage, StorageClass::Private | StorageClass::Function)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }
    pub fn set_value(&mut self, from: &Value, arena: &TypeArena) -> Result<()> {
        self.value.copy_from(from, arena)
    }

    pub fn built_in(&self) -> Option<BuiltIn> {
        self.built_in
    }
    pub fn set_built_in(&mut self, built_in: BuiltIn) {
        self.built_in = Some(built_in);
    }

    pub fn forbid_write(&mut self) {
        self.nonwritable = true;
    }
    pub fn is_writable(&self) -> bool {
        !self.nonwritable
    }

    pub fn binding(&self) -> Option<u32> {
        self.binding
    }
    pub fn set_binding(&mut self, binding: u32) {
        self.binding = Some(binding);
    }
    pub fn descriptor_set(&self) -> Option<u32> {
        self.descriptor_set
    }
    pub fn set_descriptor_set(&mut self, set: u32) {
        self.descriptor_set = Some(set);
    }
}

/// A function: its type and the instruction index it starts at.
#[derive(Clone, Debug)]
pub struct Function {
    ty: TypeHandle,
    location: usize,
    name: String,
}

impl Function {
    pub fn new(ty: TypeHandle, location: usize) -> Function {
        Function {
            ty,
            location,
            name: String::new(),
        }
    }
    pub fn ty(&self) -> TypeHandle {
        self.ty
    }
    pub fn location(&self) -> usize {
        self.location
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }
}

/// An entry point: a function plus its workgroup size.
#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub func: Function,
    pub local_size: [u32; 3],
}

impl EntryPoint {
    pub fn new(func: Function) -> EntryPoint {
        EntryPoint {
            func,
            local_size: [1, 1, 1],
        }
    }

    pub fn num_invocations(&self) -> u32 {
        self.local_size[0] * self.local_size[1] * self.local_size[2]
    }
}

/// A tagged slot in the data vector.
#[derive(Clone, Debug, Default)]
pub enum Data {
    #[default]
    None,
    Type(TypeHandle),
    Variable(Rc<RefCell<Variable>>),
    Function(Function),
    EntryPoint(EntryPoint),
    Value(Value),
}

impl Data {
    pub fn variable(var: Variable) -> Data {
        Data::Variable(Rc::new(RefCell::new(var)))
    }

    pub fn as_type(&self) -> Option<TypeHandle> {
        match self {
            Data::Type(ty) => Some(*ty),
            _ => None,
        }
    }
    pub fn as_variable(&self) -> Option<Rc<RefCell<Variable>>> {
        match self {
            Data::Variable(var) => Some(Rc::clone(var)),
            _ => None,
        }
    }
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Data::Function(f) => Some(f),
            Data::EntryPoint(e) => Some(&e.func),
            _ => None,
        }
    }
    pub fn as_entry_point(&self) -> Option<&EntryPoint> {
        match self {
            Data::EntryPoint(e) => Some(e),
            _ => None,
        }
    }

    /// Read the slot as a value. Spec constants are saved as variables but
    /// need to be usable like regular values.
    pub fn value(&self) -> Option<Value> {
        match self {
            Data::Value(val) => Some(val.clone()),
            Data::Variable(var) => {
                let var = var.borrow();
                if var.is_spec_const() {
                    Some(var.value().clone())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Handle of a [`DataView`] inside its manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewHandle(usize);

#[derive(Debug, Default)]
pub struct DataView {
    data: HashMap<u32, Data>,
    prev: Option<ViewHandle>,
}

/// Owner of all views of one program run.
#[derive(Debug)]
pub struct DataManager {
    views: Vec<Option<DataView>>,
    bound: u32,
}

impl DataManager {
    pub fn new() -> DataManager {
        DataManager {
            views: vec![Some(DataView::default())],
            bound: 0,
        }
    }

    pub fn global(&self) -> ViewHandle {
        ViewHandle(0)
    }

    pub fn bound(&self) -> u32 {
        self.bound
    }
    pub fn set_bound(&mut self, bound: u32) {
        self.bound = bound;
    }

    /// Check an id against the module's id bound.
    pub fn check_ref(&self, id: u32) -> Result<u32> {
        if id >= self.bound && self.bound != 0 {
            bail!("reference {} is beyond the data bound {}", id, self.bound);
        }
        Ok(id)
    }

    pub fn make_view(&mut self, prev: Option<ViewHandle>) -> ViewHandle {
        let view = DataView {
            data: HashMap::default(),
            prev,
        };
        for (i, slot) in self.views.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(view);
                return ViewHandle(i);
            }
        }
        self.views.push(Some(view));
        ViewHandle(self.views.len() - 1)
    }

    pub fn destroy_view(&mut self, view: ViewHandle) {
        if view.0 != 0 {
            self.views[view.0] = None;
        }
    }

    /// Duplicate a view's local entries. Variables are copied, not shared,
    /// so re-entrant launches do not clobber each other.
    pub fn deep_clone_view(&mut self, src: ViewHandle) -> ViewHandle {
        let cloned: HashMap<u32, Data> = self.view(src)
            .data
            .iter()
            .map(|(&id, data)| {
                let data = match data {
                    Data::Variable(var) => Data::variable(var.borrow().clone()),
                    other => other.clone(),
                };
                (id, data)
            })
            .collect();
        let prev = self.view(src).prev;
        let handle = self.make_view(prev);
        self.view_mut(handle).data = cloned;
        handle
    }

    fn view(&self, handle: ViewHandle) -> &DataView {
        self.views[handle.0]
            .as_ref()
            .expect("data view was destroyed")
    }
    fn view_mut(&mut self, handle: ViewHandle) -> &mut DataView {
        self.views[handle.0]
            .as_mut()
            .expect("data view was destroyed")
    }

    pub fn parent_of(&self, view: ViewHandle) -> Option<ViewHandle> {
        self.view(view).prev
    }

    /// Find the view along the chain which holds the id locally.
    pub fn owner_of(&self, view: ViewHandle, id: u32) -> Option<ViewHandle> {
        let mut at = Some(view);
        while let Some(handle) = at {
            let view = self.view(handle);
            if view.data.contains_key(&id) {
                return Some(handle);
            }
            at = view.prev;
        }
        None
    }

    pub fn contains(&self, view: ViewHandle, id: u32) -> bool {
        self.owner_of(view, id).is_some()
    }

    /// Read a slot, walking the view chain.
    pub fn get(&self, view: ViewHandle, id: u32) -> Result<&Data> {
        self.owner_of(view, id)
            .map(|owner| &self.view(owner).data[&id])
            .ok_or_else(|| anyhow!("%{} is not defined in the current scope", id))
    }

    /// Mutable access to a slot wherever it lives along the chain.
    pub fn get_mut(&mut self, view: ViewHandle, id: u32) -> Result<&mut Data> {
        let owner = self
            .owner_of(view, id)
            .ok_or_else(|| anyhow!("%{} is not defined in the current scope", id))?;
        Ok(self
            .view_mut(owner)
            .data
            .get_mut(&id)
            .expect("owner_of found the id"))
    }

    /// Define or redefine the id in the given view's local map.
    pub fn set(&mut self, view: ViewHandle, id: u32, data: Data) {
        self.view_mut(view).data.insert(id, data);
    }

    /// Ids defined locally in the given view.
    pub fn local_ids(&self, view: ViewHandle) -> Vec<u32> {
        self.view(view).data.keys().copied().collect()
    }
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Primitive;

    #[test]
    fn reads_walk_the_chain_and_writes_stay_local() {
        let arena = TypeArena::new();
        let mut mgr = DataManager::new();
        let global = mgr.global();
        mgr.set(
            global,
            1,
            Data::Value(Value::Primitive(Primitive::uint(&arena, 10))),
        );

        let frame = mgr.make_view(Some(global));
        // Read falls through to the global.
        assert_eq!(
            mgr.get(frame, 1).unwrap().value().unwrap().extract_u32("x").unwrap(),
            10
        );

        // A local write shadows without touching the parent.
        mgr.set(
            frame,
            1,
            Data::Value(Value::Primitive(Primitive::uint(&arena, 20))),
        );
        assert_eq!(
            mgr.get(frame, 1).unwrap().value().unwrap().extract_u32("x").unwrap(),
            20
        );
        assert_eq!(
            mgr.get(global, 1).unwrap().value().unwrap().extract_u32("x").unwrap(),
            10
        );
    }

    #[test]
    fn variables_alias_across_views() {
        let arena = TypeArena::new();
        let mut mgr = DataManager::new();
        let global = mgr.global();
        let var = Variable::make_spec_const(Value::Primitive(Primitive::uint(&arena, 1)));
        mgr.set(global, 5, Data::variable(var));

        let frame = mgr.make_view(Some(global));
        let alias = mgr.get(frame, 5).unwrap().as_variable().unwrap();
        alias
            .borrow_mut()
            .set_value(&Value::Primitive(Primitive::uint(&arena, 9)), &arena)
            .unwrap();

        let seen = mgr.get(global, 5).unwrap().as_variable().unwrap();
        assert_eq!(seen.borrow().value().extract_u32("x").unwrap(), 9);
    }

    #[test]
    fn spec_consts_read_as_values() {
        let arena = TypeArena::new();
        let mut mgr = DataManager::new();
        let global = mgr.global();
        let var = Variable::make_spec_const(Value::Primitive(Primitive::uint(&arena, 42)));
        mgr.set(global, 3, Data::variable(var));
        assert!(mgr.get(global, 3).unwrap().value().is_some());
    }
}

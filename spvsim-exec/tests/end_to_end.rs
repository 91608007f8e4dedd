//! End-to-end scenarios over synthesized SPIR-V modules.
//!
//! Each test assembles a small module word by word, runs it through the
//! full parse/init/execute pipeline and checks the outputs.
use spirv::{ExecutionMode, ExecutionModel, FunctionControl, Op, StorageClass};
use spvsim_exec::Program;
use spvsim_parse::bin::MAGIC;
use spvsim_parse::InstructionBuilder;
use spvsim_value::ty::{Type, TypeArena};
use spvsim_value::value::{Aggregate, Primitive, Value, ValueMap};

struct ModuleBuilder {
    words: Vec<u32>,
    bound: u32,
}

impl ModuleBuilder {
    fn new(bound: u32) -> ModuleBuilder {
        ModuleBuilder {
            words: vec![MAGIC, 0x0001_0000, 0, bound, 0],
            bound,
        }
    }

    fn inst(mut self, words: Vec<u32>) -> ModuleBuilder {
        self.words.extend(words);
        self
    }

    fn bytes(self) -> Vec<u8> {
        assert!(self.bound > 0);
        self.words
            .iter()
            .flat_map(|w| w.to_le_bytes().to_vec())
            .collect()
    }
}

fn compute_preamble(module: ModuleBuilder, main_id: u32) -> ModuleBuilder {
    module
        .inst(
            InstructionBuilder::new(Op::MemoryModel)
                .push(spirv::AddressingModel::Logical as u32)
                .push(spirv::MemoryModel::GLSL450 as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::EntryPoint)
                .push(ExecutionModel::GLCompute as u32)
                .push(main_id)
                .push_str("main")
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::ExecutionMode)
                .push(main_id)
                .push(ExecutionMode::LocalSize as u32)
                .push_list(&[1, 1, 1])
                .build(),
        )
}

fn name(id: u32, name: &str) -> Vec<u32> {
    InstructionBuilder::new(Op::Name).push(id).push_str(name).build()
}

fn run_program(bytes: &[u8], inputs: impl Fn(&TypeArena) -> ValueMap) -> ValueMap {
    let mut program = Program::new();
    program.parse("test.spv", bytes).expect("parse failed");
    let provided = inputs(program.arena());
    program.init(&provided).expect("init failed");
    program
        .check_inputs(&provided, false)
        .expect("check_inputs failed");
    program.execute(false, None).expect("execution failed");
    program.get_outputs().expect("outputs failed")
}

fn f32_out(outputs: &ValueMap, name: &str) -> f32 {
    outputs[name].as_primitive().unwrap().f32_val()
}

/// Scenario 1: one entry point copying input float `x` to output `y`.
#[test]
fn trivial_identity() {
    // Ids.
    let (void_t, fn_t, f32_t, ptr_in, ptr_out, x, y, main, lbl, tmp) =
        (1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
    let bytes = compute_preamble(ModuleBuilder::new(11), main)
        .inst(name(x, "x"))
        .inst(name(y, "y"))
        .inst(InstructionBuilder::new(Op::TypeVoid).push(void_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fn_t)
                .push(void_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeFloat)
                .push(f32_t)
                .push(32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_in)
                .push(StorageClass::Input as u32)
                .push(f32_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_out)
                .push(StorageClass::Output as u32)
                .push(f32_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_in)
                .push(x)
                .push(StorageClass::Input as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_out)
                .push(y)
                .push(StorageClass::Output as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(void_t)
                .push(main)
                .push(FunctionControl::NONE.bits())
                .push(fn_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl).build())
        .inst(
            InstructionBuilder::new(Op::Load)
                .push(f32_t)
                .push(tmp)
                .push(x)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Store).push(y).push(tmp).build())
        .inst(InstructionBuilder::new(Op::Return).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        .bytes();

    let outputs = run_program(&bytes, |arena| {
        let mut map = ValueMap::new();
        map.insert("x".to_owned(), Value::Primitive(Primitive::float(arena, 3.5)));
        map
    });
    assert_eq!(f32_out(&outputs, "y"), 3.5);
}

/// Scenario 2: `out = a + b` over vec3.
#[test]
fn vector_add() {
    let (void_t, fn_t, f32_t, v3_t, ptr_in, ptr_out) = (1, 2, 3, 4, 5, 6);
    let (a, b, out, main, lbl, la, lb, sum) = (7, 8, 9, 10, 11, 12, 13, 14);
    let bytes = compute_preamble(ModuleBuilder::new(15), main)
        .inst(name(a, "a"))
        .inst(name(b, "b"))
        .inst(name(out, "out"))
        .inst(InstructionBuilder::new(Op::TypeVoid).push(void_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fn_t)
                .push(void_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeFloat)
                .push(f32_t)
                .push(32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeVector)
                .push(v3_t)
                .push(f32_t)
                .push(3)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_in)
                .push(StorageClass::Input as u32)
                .push(v3_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_out)
                .push(StorageClass::Output as u32)
                .push(v3_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_in)
                .push(a)
                .push(StorageClass::Input as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_in)
                .push(b)
                .push(StorageClass::Input as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_out)
                .push(out)
                .push(StorageClass::Output as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(void_t)
                .push(main)
                .push(FunctionControl::NONE.bits())
                .push(fn_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl).build())
        .inst(
            InstructionBuilder::new(Op::Load)
                .push(v3_t)
                .push(la)
                .push(a)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Load)
                .push(v3_t)
                .push(lb)
                .push(b)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::FAdd)
                .push(v3_t)
                .push(sum)
                .push(la)
                .push(lb)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Store).push(out).push(sum).build())
        .inst(InstructionBuilder::new(Op::Return).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        .bytes();

    let outputs = run_program(&bytes, |arena| {
        let vec = |xs: &[f32]| {
            let elements = xs
                .iter()
                .map(|&x| Value::Primitive(Primitive::float(arena, x)))
                .collect();
            Value::Array(Aggregate::new(arena.vec3(), elements))
        };
        let mut map = ValueMap::new();
        map.insert("a".to_owned(), vec(&[1.0, 2.0, 3.0]));
        map.insert("b".to_owned(), vec(&[0.5, 0.5, 0.5]));
        map
    });
    let got = outputs["out"].extract_vec("out", 3).unwrap();
    assert_eq!(got, vec![1.5, 2.5, 3.5]);
}

fn branch_module() -> Vec<u8> {
    let (void_t, fn_t, bool_t, i32_t, ptr_in, ptr_out) = (1, 2, 3, 4, 5, 6);
    let (cond, out, c7, cm7, main, lbl0, lc, lbl_t, lbl_f, lbl_m, phi) =
        (7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17);
    compute_preamble(ModuleBuilder::new(18), main)
        .inst(name(cond, "cond"))
        .inst(name(out, "out"))
        .inst(InstructionBuilder::new(Op::TypeVoid).push(void_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fn_t)
                .push(void_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::TypeBool).push(bool_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeInt)
                .push(i32_t)
                .push(32)
                .push(1)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_in)
                .push(StorageClass::Input as u32)
                .push(bool_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_out)
                .push(StorageClass::Output as u32)
                .push(i32_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(i32_t)
                .push(c7)
                .push(7)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(i32_t)
                .push(cm7)
                .push((-7i32) as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_in)
                .push(cond)
                .push(StorageClass::Input as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_out)
                .push(out)
                .push(StorageClass::Output as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(void_t)
                .push(main)
                .push(FunctionControl::NONE.bits())
                .push(fn_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl0).build())
        .inst(
            InstructionBuilder::new(Op::Load)
                .push(bool_t)
                .push(lc)
                .push(cond)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::SelectionMerge)
                .push(lbl_m)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::BranchConditional)
                .push(lc)
                .push(lbl_t)
                .push(lbl_f)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl_t).build())
        .inst(InstructionBuilder::new(Op::Branch).push(lbl_m).build())
        .inst(InstructionBuilder::new(Op::Label).push(lbl_f).build())
        .inst(InstructionBuilder::new(Op::Branch).push(lbl_m).build())
        .inst(InstructionBuilder::new(Op::Label).push(lbl_m).build())
        .inst(
            InstructionBuilder::new(Op::Phi)
                .push(i32_t)
                .push(phi)
                .push_list(&[c7, lbl_t, cm7, lbl_f])
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Store).push(out).push(phi).build())
        .inst(InstructionBuilder::new(Op::Return).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        .bytes()
}

/// Scenario 3: `out = cond ? 7 : -7`, with the phi choosing by the edge
/// taken.
#[test]
fn branch_on_bool() {
    for (cond, expected) in [(true, 7), (false, -7)] {
        let outputs = run_program(&branch_module(), |arena| {
            let mut map = ValueMap::new();
            map.insert(
                "cond".to_owned(),
                Value::Primitive(Primitive::boolean(arena, cond)),
            );
            map
        });
        assert_eq!(
            outputs["out"].as_primitive().unwrap().i32_val(),
            expected,
            "cond = {}",
            cond
        );
    }
}

/// Scenario 4: recursive factorial driven by a specialization constant.
#[test]
fn recursive_factorial() {
    let (void_t, fn_t, u32_t, fact_fn_t, bool_t, ptr_out) = (1, 2, 3, 4, 5, 6);
    let (n, c0, c1, out, main, fact) = (7, 8, 9, 10, 11, 12);
    let (p, f_lbl, is_zero, lbl_base, lbl_rec, pm1, sub, mul) = (13, 14, 15, 16, 17, 18, 19, 20);
    let (m_lbl, call) = (21, 22);
    let bytes = compute_preamble(ModuleBuilder::new(24), main)
        .inst(name(n, "N"))
        .inst(name(out, "out"))
        .inst(InstructionBuilder::new(Op::TypeVoid).push(void_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fn_t)
                .push(void_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeInt)
                .push(u32_t)
                .push(32)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fact_fn_t)
                .push(u32_t)
                .push(u32_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::TypeBool).push(bool_t).build())
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_out)
                .push(StorageClass::Output as u32)
                .push(u32_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::SpecConstant)
                .push(u32_t)
                .push(n)
                .push(1)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(u32_t)
                .push(c0)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(u32_t)
                .push(c1)
                .push(1)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_out)
                .push(out)
                .push(StorageClass::Output as u32)
                .build(),
        )
        // fact(p) = p == 0 ? 1 : p * fact(p - 1)
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(u32_t)
                .push(fact)
                .push(FunctionControl::NONE.bits())
                .push(fact_fn_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::FunctionParameter)
                .push(u32_t)
                .push(p)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(f_lbl).build())
        .inst(
            InstructionBuilder::new(Op::IEqual)
                .push(bool_t)
                .push(is_zero)
                .push(p)
                .push(c0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::BranchConditional)
                .push(is_zero)
                .push(lbl_base)
                .push(lbl_rec)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl_base).build())
        .inst(InstructionBuilder::new(Op::ReturnValue).push(c1).build())
        .inst(InstructionBuilder::new(Op::Label).push(lbl_rec).build())
        .inst(
            InstructionBuilder::new(Op::ISub)
                .push(u32_t)
                .push(pm1)
                .push(p)
                .push(c1)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::FunctionCall)
                .push(u32_t)
                .push(sub)
                .push(fact)
                .push(pm1)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::IMul)
                .push(u32_t)
                .push(mul)
                .push(p)
                .push(sub)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::ReturnValue).push(mul).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        // main: out = fact(N)
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(void_t)
                .push(main)
                .push(FunctionControl::NONE.bits())
                .push(fn_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(m_lbl).build())
        .inst(
            InstructionBuilder::new(Op::FunctionCall)
                .push(u32_t)
                .push(call)
                .push(fact)
                .push(n)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Store).push(out).push(call).build())
        .inst(InstructionBuilder::new(Op::Return).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        .bytes();

    let outputs = run_program(&bytes, |arena| {
        let mut map = ValueMap::new();
        map.insert("N".to_owned(), Value::Primitive(Primitive::uint(arena, 5)));
        map
    });
    assert_eq!(outputs["out"].as_primitive().unwrap().u32_val(), 120);
}

// Ray tracing scenario support.

/// The external `{tlas, box_nodes, instance_nodes, triangle_nodes,
/// procedural_nodes}` struct.
fn accel_input(arena: &mut TypeArena, with_triangle: bool) -> Value {
    use spvsim_value::rt::node::{BoxNode, NodeRef, TriangleNode};

    let child = if with_triangle {
        vec![NodeRef::new(3, 0)]
    } else {
        Vec::new()
    };
    let root = BoxNode {
        min_bounds: [-1.0, -1.0, 0.5],
        max_bounds: [1.0, 1.0, 1.5],
        children: child,
    };
    let box_val = root.to_value(arena);
    let tri_vals: Vec<Value> = if with_triangle {
        vec![TriangleNode {
            geometry_index: 0,
            primitive_index: 0,
            opaque: true,
            vertices: [[-1.0, -1.0, 1.0], [0.0, 1.0, 1.0], [1.0, -1.0, 1.0]],
        }
        .to_value(arena)]
    } else {
        Vec::new()
    };

    let tlas = Value::Array(Aggregate::new(
        arena.uvec2(),
        vec![
            Value::Primitive(Primitive::uint(arena, 1)),
            Value::Primitive(Primitive::uint(arena, 0)),
        ],
    ));
    let boxes_ty = arena.intern(Type::array(1, box_val.ty()));
    let boxes = Value::Array(Aggregate::new(boxes_ty, vec![box_val]));
    let insts_ty = arena.intern(Type::array(0, arena.uvec2()));
    let instances = Value::Array(Aggregate::new(insts_ty, Vec::new()));
    let tris_ty = arena.intern(Type::array(
        tri_vals.len() as u32,
        tri_vals.first().map(Value::ty).unwrap_or_else(|| arena.uvec2()),
    ));
    let triangles = Value::Array(Aggregate::new(tris_ty, tri_vals));
    let procs_ty = arena.intern(Type::array(0, arena.uvec2()));
    let procedurals = Value::Array(Aggregate::new(procs_ty, Vec::new()));

    let fields = vec![
        tlas.ty(),
        boxes.ty(),
        instances.ty(),
        triangles.ty(),
        procedurals.ty(),
    ];
    let names = spvsim_value::rt::accel::ACCEL_STRUCT_FIELDS
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    let ty = arena.intern(Type::structure_named(fields, names));
    Value::Struct(Aggregate::new(
        ty,
        vec![tlas, boxes, instances, triangles, procedurals],
    ))
}

fn raygen_module() -> Vec<u8> {
    let (void_t, fn_t, f32_t, u32_t, v3_t, accel_t, payload_t) = (1, 2, 3, 4, 5, 6, 7);
    let (ptr_accel, ptr_payload, scene, payload) = (8, 9, 10, 11);
    let (c_flags, c_mask, c0, c_tmin, c_tmax, cf0, cf1, c_origin, c_dir) =
        (12, 13, 14, 15, 16, 17, 18, 19, 20);
    let (main, lbl, ld) = (21, 22, 23);
    ModuleBuilder::new(24)
        .inst(
            InstructionBuilder::new(Op::MemoryModel)
                .push(spirv::AddressingModel::Logical as u32)
                .push(spirv::MemoryModel::GLSL450 as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::EntryPoint)
                .push(ExecutionModel::RayGenerationKHR as u32)
                .push(main)
                .push_str("main")
                .build(),
        )
        .inst(name(scene, "scene"))
        .inst(name(payload, "payload"))
        .inst(InstructionBuilder::new(Op::TypeVoid).push(void_t).build())
        .inst(
            InstructionBuilder::new(Op::TypeFunction)
                .push(fn_t)
                .push(void_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeFloat)
                .push(f32_t)
                .push(32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeInt)
                .push(u32_t)
                .push(32)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeVector)
                .push(v3_t)
                .push(f32_t)
                .push(3)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeAccelerationStructureKHR)
                .push(accel_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypeStruct)
                .push(payload_t)
                .push_list(&[f32_t, u32_t, u32_t, u32_t])
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_accel)
                .push(StorageClass::UniformConstant as u32)
                .push(accel_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TypePointer)
                .push(ptr_payload)
                .push(StorageClass::RayPayloadKHR as u32)
                .push(payload_t)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_accel)
                .push(scene)
                .push(StorageClass::UniformConstant as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Variable)
                .push(ptr_payload)
                .push(payload)
                .push(StorageClass::RayPayloadKHR as u32)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(u32_t)
                .push(c_flags)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(u32_t)
                .push(c_mask)
                .push(0xFF)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(u32_t)
                .push(c0)
                .push(0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(f32_t)
                .push(c_tmin)
                .push_f32(0.001)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(f32_t)
                .push(c_tmax)
                .push_f32(1000.0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(f32_t)
                .push(cf0)
                .push_f32(0.0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Constant)
                .push(f32_t)
                .push(cf1)
                .push_f32(1.0)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::ConstantComposite)
                .push(v3_t)
                .push(c_origin)
                .push_list(&[cf0, cf0, cf0])
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::ConstantComposite)
                .push(v3_t)
                .push(c_dir)
                .push_list(&[cf0, cf0, cf1])
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::Function)
                .push(void_t)
                .push(main)
                .push(FunctionControl::NONE.bits())
                .push(fn_t)
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Label).push(lbl).build())
        .inst(
            InstructionBuilder::new(Op::Load)
                .push(accel_t)
                .push(ld)
                .push(scene)
                .build(),
        )
        .inst(
            InstructionBuilder::new(Op::TraceRayKHR)
                .push_list(&[
                    ld, c_flags, c_mask, c0, c0, c0, c_origin, c_tmin, c_dir, c_tmax, payload,
                ])
                .build(),
        )
        .inst(InstructionBuilder::new(Op::Return).build())
        .inst(InstructionBuilder::new(Op::FunctionEnd).build())
        .bytes()
}

/// Scenario 5: a miss trace without an SBT fills the default payload.
#[test]
fn trace_miss_without_sbt() {
    let mut program = Program::new();
    program.parse("test.spv", &raygen_module()).unwrap();
    let provided = {
        let arena = program.arena_mut();
        let mut map = ValueMap::new();
        map.insert("scene".to_owned(), accel_input(arena, false));
        map
    };
    program.init(&provided).unwrap();
    program.check_inputs(&provided, false).unwrap();
    program.execute(false, None).unwrap();
    let outputs = program.get_outputs().unwrap();
    let payload = outputs["payload"].as_aggregate().unwrap();
    assert_eq!(payload.get(0).unwrap().as_primitive().unwrap().f32_val(), f32::MAX);
    assert_eq!(payload.get(1).unwrap().as_primitive().unwrap().u32_val(), 0);
    assert_eq!(payload.get(2).unwrap().as_primitive().unwrap().u32_val(), 0);
    assert_eq!(payload.get(3).unwrap().as_primitive().unwrap().u32_val(), 0);
}

/// Scenario 6: a single triangle at z=1 hit by a ray along +Z.
#[test]
fn trace_single_triangle_hit() {
    let mut program = Program::new();
    program.parse("test.spv", &raygen_module()).unwrap();
    let provided = {
        let arena = program.arena_mut();
        let mut map = ValueMap::new();
        map.insert("scene".to_owned(), accel_input(arena, true));
        map
    };
    program.init(&provided).unwrap();
    program.check_inputs(&provided, true).unwrap();
    program.execute(false, None).unwrap();
    let outputs = program.get_outputs().unwrap();
    let payload = outputs["payload"].as_aggregate().unwrap();
    let hit_t = payload.get(0).unwrap().as_primitive().unwrap().f32_val();
    assert!((hit_t - 1.0).abs() < 1e-4, "hitT = {}", hit_t);
    assert_eq!(payload.get(1).unwrap().as_primitive().unwrap().u32_val(), 0);
    assert_eq!(payload.get(2).unwrap().as_primitive().unwrap().u32_val(), 0);
    // Front-facing triangle hit kind.
    assert_eq!(
        payload.get(3).unwrap().as_primitive().unwrap().u32_val(),
        0xFE
    );
}

/// The phi result is a clone: overwriting it does not touch the source
/// constant.
#[test]
fn phi_clones_its_source() {
    // Run the branch module twice with the same constants; if the phi
    // aliased its operand, the second run through the true edge would
    // observe the clobbered constant.
    for _ in 0..2 {
        let outputs = run_program(&branch_module(), |arena| {
            let mut map = ValueMap::new();
            map.insert(
                "cond".to_owned(),
                Value::Primitive(Primitive::boolean(arena, true)),
            );
            map
        });
        assert_eq!(outputs["out"].as_primitive().unwrap().i32_val(), 7);
    }
}

/// BVH partitioning: the flat node array keeps the
/// `[box | instance | triangle | procedural]` order and total length.
#[test]
fn bvh_partitions_preserve_counts() {
    let mut program = Program::new();
    program.parse("test.spv", &raygen_module()).unwrap();
    let arena = program.arena_mut();
    let input = accel_input(arena, true);
    let ty = arena.intern(Type::accel_struct());
    let mut accel = spvsim_value::rt::accel::AccelStruct::empty(ty);
    accel.copy_from(&input, arena).unwrap();
    assert_eq!(accel.node_count(), 2);
    assert_eq!(accel.partition_counts(), (1, 0, 1, 0));
}

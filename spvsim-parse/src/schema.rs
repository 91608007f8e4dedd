//! Per-opcode operand schemas.
//!
//! Each supported opcode carries the shape of its result ids and an ordered
//! list of required operand kinds, plus an optional tail which may repeat.
//! The result type and result ids are not part of the lists; the decoder
//! handles them first whenever the shape says they are present.
use spirv::Op;

use crate::error::{anyhow, Result};
use crate::token::TokenKind;

#[derive(Clone, Copy, Debug)]
pub struct OpSchema {
    pub has_result: bool,
    pub has_result_type: bool,
    pub required: &'static [TokenKind],
    pub optional: &'static [TokenKind],
    /// Whether the optional tail may be consumed more than once.
    pub repeating: bool,
    /// Metadata ops tolerate trailing words we have no use for.
    pub lax: bool,
}

use TokenKind::{Const as C, Int as I, Ref as R, String as S, Uint as U};

// Shorthand constructors for the three common result shapes.
const fn plain(required: &'static [TokenKind]) -> OpSchema {
    OpSchema {
        has_result: false,
        has_result_type: false,
        required,
        optional: &[],
        repeating: false,
        lax: false,
    }
}
const fn result(required: &'static [TokenKind]) -> OpSchema {
    let mut base = plain(required);
    base.has_result = true;
    base
}
const fn typed(required: &'static [TokenKind]) -> OpSchema {
    let mut base = plain(required);
    base.has_result = true;
    base.has_result_type = true;
    base
}
const fn tail(mut base: OpSchema, optional: &'static [TokenKind], repeating: bool) -> OpSchema {
    base.optional = optional;
    base.repeating = repeating;
    base
}
const fn lax(mut base: OpSchema) -> OpSchema {
    base.lax = true;
    base
}

/// Fetch the schema for the given op, or fail for anything the interpreter
/// does not support.
pub fn lookup(op: Op) -> Result<OpSchema> {
    let schema = match op {
        // Module metadata. Trailing debug operands are skipped.
        Op::Nop | Op::NoLine => plain(&[]),
        Op::Source => lax(plain(&[C, U])),
        Op::SourceExtension | Op::ModuleProcessed | Op::Extension => plain(&[S]),
        Op::Line => plain(&[R, U, U]),
        Op::Name => plain(&[R, S]),
        Op::MemberName => plain(&[R, U, S]),
        Op::String => result(&[S]),
        Op::Capability => plain(&[C]),
        Op::MemoryModel => plain(&[C, C]),
        Op::EntryPoint => tail(plain(&[C, R, S]), &[R], true),
        Op::ExecutionMode => tail(plain(&[R, C]), &[U], true),
        Op::ExecutionModeId => tail(plain(&[R, C]), &[R], true),
        Op::ExtInstImport => result(&[S]),
        Op::ExtInst => tail(typed(&[R, U]), &[R], true),
        Op::Decorate => tail(plain(&[R, C]), &[U], true),
        Op::MemberDecorate => tail(plain(&[R, U, C]), &[U], true),

        // Types.
        Op::TypeVoid
        | Op::TypeBool
        | Op::TypeSampler
        | Op::TypeAccelerationStructureKHR
        | Op::TypeRayQueryKHR => result(&[]),
        Op::TypeInt => result(&[U, U]),
        Op::TypeFloat => result(&[U]),
        Op::TypeVector | Op::TypeMatrix => result(&[R, U]),
        Op::TypeImage => tail(result(&[R, C, U, U, U, U, C]), &[C], false),
        Op::TypeSampledImage => result(&[R]),
        Op::TypeArray => result(&[R, R]),
        Op::TypeRuntimeArray => result(&[R]),
        Op::TypeStruct => tail(result(&[]), &[R], true),
        Op::TypePointer => result(&[C, R]),
        Op::TypeFunction => tail(result(&[R]), &[R], true),
        Op::TypeCooperativeMatrixKHR => result(&[R, R, R, R, R]),

        // Constants.
        Op::ConstantTrue
        | Op::ConstantFalse
        | Op::ConstantNull
        | Op::SpecConstantTrue
        | Op::SpecConstantFalse
        | Op::Undef => typed(&[]),
        Op::Constant | Op::SpecConstant => tail(typed(&[U]), &[U], false),
        Op::ConstantComposite | Op::SpecConstantComposite | Op::CompositeConstruct => {
            tail(typed(&[]), &[R], true)
        }
        Op::SpecConstantOp => tail(typed(&[C]), &[R], true),

        // Functions and memory.
        Op::Function => typed(&[C, R]),
        Op::FunctionParameter => typed(&[]),
        Op::FunctionEnd => plain(&[]),
        Op::FunctionCall => tail(typed(&[R]), &[R], true),
        Op::Variable => tail(typed(&[C]), &[R], false),
        Op::Load => tail(typed(&[R]), &[U], false),
        Op::Store => tail(plain(&[R, R]), &[U], false),
        Op::AccessChain | Op::InBoundsAccessChain => tail(typed(&[R]), &[R], true),
        Op::ArrayLength => typed(&[R, U]),
        Op::CopyObject => typed(&[R]),

        // Composites.
        Op::VectorShuffle => tail(typed(&[R, R]), &[U], true),
        Op::CompositeExtract => tail(typed(&[R]), &[U], true),
        Op::CompositeInsert => tail(typed(&[R, R]), &[U], true),
        Op::Transpose => typed(&[R]),
        Op::VectorExtractDynamic => typed(&[R, R]),
        Op::VectorInsertDynamic => typed(&[R, R, R]),

        // Unary arithmetic and conversion.
        Op::SNegate
        | Op::FNegate
        | Op::Not
        | Op::LogicalNot
        | Op::Any
        | Op::All
        | Op::IsNan
        | Op::IsInf
        | Op::ConvertFToU
        | Op::ConvertFToS
        | Op::ConvertSToF
        | Op::ConvertUToF
        | Op::UConvert
        | Op::SConvert
        | Op::FConvert
        | Op::Bitcast => typed(&[R]),

        // Binary arithmetic, bit and relational ops.
        Op::IAdd
        | Op::FAdd
        | Op::ISub
        | Op::FSub
        | Op::IMul
        | Op::FMul
        | Op::UDiv
        | Op::SDiv
        | Op::FDiv
        | Op::UMod
        | Op::SRem
        | Op::SMod
        | Op::FRem
        | Op::FMod
        | Op::VectorTimesScalar
        | Op::MatrixTimesScalar
        | Op::VectorTimesMatrix
        | Op::MatrixTimesVector
        | Op::MatrixTimesMatrix
        | Op::Dot
        | Op::ShiftRightLogical
        | Op::ShiftRightArithmetic
        | Op::ShiftLeftLogical
        | Op::BitwiseOr
        | Op::BitwiseXor
        | Op::BitwiseAnd
        | Op::LogicalEqual
        | Op::LogicalNotEqual
        | Op::LogicalOr
        | Op::LogicalAnd
        | Op::IEqual
        | Op::INotEqual
        | Op::UGreaterThan
        | Op::SGreaterThan
        | Op::UGreaterThanEqual
        | Op::SGreaterThanEqual
        | Op::ULessThan
        | Op::SLessThan
        | Op::ULessThanEqual
        | Op::SLessThanEqual
        | Op::FOrdEqual
        | Op::FOrdNotEqual
        | Op::FOrdLessThan
        | Op::FOrdGreaterThan
        | Op::FOrdLessThanEqual
        | Op::FOrdGreaterThanEqual => typed(&[R, R]),
        Op::Select => typed(&[R, R, R]),

        // Images.
        Op::SampledImage => typed(&[R, R]),
        Op::ImageSampleImplicitLod => tail(typed(&[R, R]), &[C, R], false),
        Op::ImageSampleExplicitLod => typed(&[R, R, C, R]),
        Op::ImageFetch | Op::ImageRead => tail(typed(&[R, R]), &[C], false),
        Op::ImageWrite => tail(plain(&[R, R, R]), &[C], false),
        Op::Image => typed(&[R]),
        Op::ImageQuerySize => typed(&[R]),
        Op::ImageQuerySizeLod => typed(&[R, R]),

        // Control flow.
        Op::Phi => tail(typed(&[R, R]), &[R, R], true),
        Op::LoopMerge => tail(plain(&[R, R, C]), &[U], true),
        Op::SelectionMerge => plain(&[R, C]),
        Op::Label => result(&[]),
        Op::Branch => plain(&[R]),
        Op::BranchConditional => tail(plain(&[R, R, R]), &[U, U], false),
        Op::Switch => tail(plain(&[R, R]), &[I, R], true),
        Op::Kill | Op::Return | Op::Unreachable | Op::TerminateInvocation => plain(&[]),
        Op::ReturnValue => plain(&[R]),
        Op::ControlBarrier => plain(&[R, R, R]),
        Op::MemoryBarrier => plain(&[R, R]),

        // Cooperative matrices.
        Op::CooperativeMatrixLoadKHR => tail(typed(&[R, R]), &[R], false),
        Op::CooperativeMatrixStoreKHR => tail(plain(&[R, R, R]), &[R], false),
        Op::CooperativeMatrixMulAddKHR => tail(typed(&[R, R, R]), &[C], false),
        Op::CooperativeMatrixLengthKHR => typed(&[R]),

        // Ray tracing pipeline.
        Op::TraceRayKHR => plain(&[R, R, R, R, R, R, R, R, R, R, R]),
        Op::ExecuteCallableKHR => plain(&[R, R]),
        Op::IgnoreIntersectionKHR | Op::TerminateRayKHR => plain(&[]),
        Op::ReportIntersectionKHR => typed(&[R, R]),

        // Ray queries.
        Op::RayQueryInitializeKHR => plain(&[R, R, R, R, R, R, R, R]),
        Op::RayQueryTerminateKHR | Op::RayQueryConfirmIntersectionKHR => plain(&[R]),
        Op::RayQueryGenerateIntersectionKHR => plain(&[R, R]),
        Op::RayQueryProceedKHR => typed(&[R]),
        Op::RayQueryGetIntersectionTypeKHR
        | Op::RayQueryGetIntersectionTKHR
        | Op::RayQueryGetIntersectionInstanceCustomIndexKHR
        | Op::RayQueryGetIntersectionInstanceIdKHR
        | Op::RayQueryGetIntersectionInstanceShaderBindingTableRecordOffsetKHR
        | Op::RayQueryGetIntersectionGeometryIndexKHR
        | Op::RayQueryGetIntersectionPrimitiveIndexKHR
        | Op::RayQueryGetIntersectionBarycentricsKHR
        | Op::RayQueryGetIntersectionFrontFaceKHR
        | Op::RayQueryGetIntersectionObjectRayDirectionKHR
        | Op::RayQueryGetIntersectionObjectRayOriginKHR
        | Op::RayQueryGetIntersectionObjectToWorldKHR
        | Op::RayQueryGetIntersectionWorldToObjectKHR => typed(&[R, R]),
        Op::RayQueryGetWorldRayDirectionKHR
        | Op::RayQueryGetWorldRayOriginKHR
        | Op::RayQueryGetIntersectionCandidateAABBOpaqueKHR => typed(&[R]),

        _ => return Err(anyhow!("unsupported opcode {:?}", op)),
    };
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_op_is_rejected() {
        assert!(lookup(Op::EmitVertex).is_err());
    }

    #[test]
    fn result_shapes() {
        let store = lookup(Op::Store).unwrap();
        assert!(!store.has_result && !store.has_result_type);
        let label = lookup(Op::Label).unwrap();
        assert!(label.has_result && !label.has_result_type);
        let add = lookup(Op::FAdd).unwrap();
        assert!(add.has_result && add.has_result_type);
    }
}

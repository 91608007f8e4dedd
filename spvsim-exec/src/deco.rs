//! Deferred decoration application.
//!
//! Many decorations may exist, but few instructions are decorated, so the
//! queue is a vector of requests, each binding one target id to the
//! pending decoration instructions aimed at it.
use num_traits::FromPrimitive;
use spirv::{BuiltIn, Decoration, Op};
use spvsim_parse::Instruction;
use spvsim_value::Variable;

use crate::error::Result;

#[derive(Debug)]
pub struct DecoRequest {
    pub target: u32,
    /// Indices of the pending decoration instructions.
    pub pending: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct DecoQueue {
    requests: Vec<DecoRequest>,
}

impl DecoQueue {
    /// Queue the instruction if it is a decoration; returns whether it was.
    pub fn queue(&mut self, inst: &Instruction, location: usize) -> Result<bool> {
        let target_at = match inst.op() {
            Op::Name | Op::MemberName | Op::Decorate | Op::MemberDecorate | Op::ExecutionMode
            | Op::ExecutionModeId => 0,
            Op::EntryPoint => 1,
            _ => return Ok(false),
        };
        let target = inst.ref_at(target_at)?;
        match self.requests.iter_mut().find(|r| r.target == target) {
            Some(request) => request.pending.push(location),
            None => self.requests.push(DecoRequest {
                target,
                pending: vec![location],
            }),
        }
        Ok(true)
    }

    /// The pending decoration locations for a target, if any.
    pub fn find(&self, target: u32) -> Option<&[usize]> {
        self.requests
            .iter()
            .find(|r| r.target == target)
            .map(|r| r.pending.as_slice())
    }
}

/// Apply the queued name/member-name decorations to a struct type's member
/// names, returning the type name if one was given.
pub fn apply_type_decos(
    insts: &[Instruction],
    pending: &[usize],
    mut name_member: impl FnMut(usize, String),
) -> Result<Option<String>> {
    let mut type_name = None;
    for &at in pending {
        let deco = &insts[at];
        match deco.op() {
            Op::Name => type_name = Some(deco.str_at(1)?.to_owned()),
            Op::MemberName => {
                let idx = deco.u32_at(1)? as usize;
                name_member(idx, deco.str_at(2)?.to_owned());
            }
            _ => {}
        }
    }
    Ok(type_name)
}

/// Apply the queued decorations to a variable: name, built-in, location,
/// binding, descriptor set and NonWritable.
pub fn apply_var_decos(insts: &[Instruction], pending: &[usize], var: &mut Variable) -> Result<()> {
    for &at in pending {
        let deco = &insts[at];
        match deco.op() {
            Op::Name => var.set_name(deco.str_at(1)?.to_owned()),
            Op::Decorate => {
                let kind = deco.u32_at(1)?;
                match Decoration::from_u32(kind) {
                    Some(Decoration::BuiltIn) => {
                        if let Some(built_in) = BuiltIn::from_u32(deco.u32_at(2)?) {
                            var.set_built_in(built_in);
                        }
                    }
                    Some(Decoration::Location) => var.set_binding(deco.u32_at(2)?),
                    Some(Decoration::Binding) => var.set_binding(deco.u32_at(2)?),
                    Some(Decoration::DescriptorSet) => var.set_descriptor_set(deco.u32_at(2)?),
                    Some(Decoration::NonWritable) => var.forbid_write(),
                    Some(Decoration::SpecId) => {
                        // Spec constants are matched by name; nothing to
                        // record beyond letting the id exist.
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Fetch the queued function name, if any.
pub fn apply_func_decos(insts: &[Instruction], pending: &[usize]) -> Result<Option<String>> {
    let mut name = None;
    for &at in pending {
        let deco = &insts[at];
        if deco.op() == Op::Name {
            name = Some(deco.str_at(1)?.to_owned());
        }
    }
    Ok(name)
}

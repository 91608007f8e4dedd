//! Raw SPIR-V instruction stream.
use anyhow::bail;
use num_traits::FromPrimitive;
use spirv::Op;
use std::fmt;

use crate::error::{anyhow, Result};

/// Iterator over the raw instructions of a word stream.
pub struct Instrs<'a> {
    inner: &'a [u32],
    cache: Option<Instr<'a>>,
}
impl<'a> Instrs<'a> {
    pub fn new(spv: &'a [u32]) -> Result<Instrs<'a>> {
        let mut out = Instrs {
            inner: spv,
            cache: None,
        };
        out.load_next()?;
        Ok(out)
    }

    fn load_next(&mut self) -> Result<()> {
        let mut new_cache = None;
        if let Some(head) = self.inner.first() {
            let len = (*head >> 16) as usize;
            if len == 0 {
                bail!("instruction length is zero");
            }
            if len > self.inner.len() {
                bail!("instruction is truncated");
            }
            new_cache = Some(Instr::new(&self.inner[..len])?);
            self.inner = &self.inner[len..];
        }
        self.cache = new_cache;
        Ok(())
    }

    pub fn peek(&self) -> Option<Instr<'a>> {
        self.cache
    }
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Instr<'a>>> {
        let last_cache = self.cache.take();
        self.load_next()?;
        Ok(last_cache)
    }
}

/// A single raw instruction: the packed opcode word followed by its operand
/// words.
#[derive(Clone, Copy)]
pub struct Instr<'a> {
    inner: &'a [u32],
}
impl<'a> Instr<'a> {
    pub fn new(x: &'a [u32]) -> Result<Instr<'a>> {
        if x.is_empty() {
            return Err(anyhow!("instruction is too short"));
        }
        Ok(Instr { inner: x })
    }

    /// Get the instruction opcode.
    pub fn opcode(&self) -> u32 {
        self.inner[0] & 0xFFFF
    }
    /// Get the instruction op, if the opcode is known to the headers at all.
    pub fn op(&self) -> Result<Op> {
        Op::from_u32(self.opcode()).ok_or_else(|| anyhow!("unsupported opcode {}", self.opcode()))
    }
    /// Word count including the leading opcode word.
    pub fn word_count(&self) -> usize {
        self.inner.len()
    }
    /// The operand words following the opcode word.
    pub fn operands(&self) -> &'a [u32] {
        &self.inner[1..]
    }
}
impl<'a> AsRef<[u32]> for Instr<'a> {
    fn as_ref(&self) -> &[u32] {
        self.inner
    }
}
impl<'a> fmt::Debug for Instr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Ok(op) => write!(f, "{:?} {:?}", op, &self.inner[1..]),
            Err(_) => write!(f, "Op({}) {:?}", self.opcode(), &self.inner[1..]),
        }
    }
}

/// Builder to synthesize instructions word by word, mostly useful to
/// construct test modules without a shader compiler.
pub struct InstructionBuilder {
    inner: Vec<u32>,
}
impl InstructionBuilder {
    pub fn new(op: Op) -> InstructionBuilder {
        InstructionBuilder {
            inner: vec![(op as u32) & 0xFFFF],
        }
    }
    pub fn push(mut self, x: u32) -> Self {
        self.inner.push(x);
        self
    }
    pub fn push_f32(mut self, x: f32) -> Self {
        self.inner.push(x.to_bits());
        self
    }
    pub fn push_list(mut self, x: &[u32]) -> Self {
        self.inner.extend_from_slice(x);
        self
    }
    pub fn push_str(mut self, x: &str) -> Self {
        let mut bytes = x.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        for chunk in bytes.chunks_exact(4) {
            self.inner
                .push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self
    }
    pub fn build(mut self) -> Vec<u32> {
        self.inner[0] |= (self.inner.len() as u32) << 16;
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_packs_word_count() {
        let words = InstructionBuilder::new(Op::TypeInt)
            .push(1)
            .push(32)
            .push(0)
            .build();
        assert_eq!(words[0] >> 16, 4);
        assert_eq!(words[0] & 0xFFFF, Op::TypeInt as u32);
    }

    #[test]
    fn builder_packs_strings() {
        // "main" needs exactly two words: 4 characters plus the nul.
        let words = InstructionBuilder::new(Op::Name).push(1).push_str("main").build();
        assert_eq!(words.len(), 4);
        assert_eq!(words[2], u32::from_le_bytes(*b"main"));
        assert_eq!(words[3], 0);
    }

    #[test]
    fn zero_length_instruction_is_rejected() {
        assert!(Instrs::new(&[0]).is_err());
    }

    #[test]
    fn truncated_instruction_is_rejected() {
        let words = [(3u32 << 16) | Op::TypeInt as u32, 1];
        assert!(Instrs::new(&words).is_err());
    }
}

//! Word-stream to token-list decoding.
use anyhow::bail;
use spirv::Op;

use crate::bin::SpirvBinary;
use crate::error::{anyhow, Result};
use crate::schema::{self, OpSchema};
use crate::token::{Token, TokenKind};

/// A fully decoded instruction.
///
/// When present, the result type id is operand 0 and the result id follows
/// it, exactly as they appear in the word stream. Downstream passes index
/// operands by position with that layout in mind.
#[derive(Clone, Debug)]
pub struct Instruction {
    op: Op,
    has_result: bool,
    has_result_type: bool,
    operands: Vec<Token>,
}

impl Instruction {
    pub fn op(&self) -> Op {
        self.op
    }
    pub fn has_result(&self) -> bool {
        self.has_result
    }
    pub fn has_result_type(&self) -> bool {
        self.has_result_type
    }
    pub fn operands(&self) -> &[Token] {
        &self.operands
    }

    /// The result id, or 0 if the instruction makes none.
    pub fn result_id(&self) -> u32 {
        if self.has_result {
            let idx = if self.has_result_type { 1 } else { 0 };
            match self.operands[idx] {
                Token::Ref(id) => id,
                _ => 0,
            }
        } else {
            0
        }
    }

    /// The result type id, or 0 if the instruction carries none.
    pub fn result_type_id(&self) -> u32 {
        if self.has_result_type {
            match self.operands[0] {
                Token::Ref(id) => id,
                _ => 0,
            }
        } else {
            0
        }
    }

    pub fn operand(&self, idx: usize) -> Result<&Token> {
        self.operands
            .get(idx)
            .ok_or_else(|| anyhow!("{:?} is missing operand {}", self.op, idx))
    }
    pub fn ref_at(&self, idx: usize) -> Result<u32> {
        self.operand(idx)?.as_ref_id()
    }
    pub fn u32_at(&self, idx: usize) -> Result<u32> {
        self.operand(idx)?.as_u32()
    }
    pub fn str_at(&self, idx: usize) -> Result<&str> {
        self.operand(idx)?.as_str()
    }

    /// Decode one instruction from its opcode and operand words.
    pub fn decode(op: Op, words: &[u32]) -> Result<Instruction> {
        let schema = schema::lookup(op)?;
        let mut inst = Instruction {
            op,
            has_result: schema.has_result,
            has_result_type: schema.has_result_type,
            operands: Vec::new(),
        };
        let mut cursor = Cursor { words, at: 0 };

        if schema.has_result_type {
            inst.operands.push(Token::Ref(cursor.word(op, "result type")?));
        }
        if schema.has_result {
            inst.operands.push(Token::Ref(cursor.word(op, "result")?));
        }
        for &kind in schema.required {
            cursor.read(kind, op, &mut inst.operands)?;
        }
        if !schema.optional.is_empty() && !cursor.done() {
            loop {
                for &kind in schema.optional {
                    cursor.read(kind, op, &mut inst.operands)?;
                }
                if !schema.repeating || cursor.done() {
                    break;
                }
            }
        }
        cursor.finish(op, &schema)?;
        Ok(inst)
    }
}

struct Cursor<'a> {
    words: &'a [u32],
    at: usize,
}
impl<'a> Cursor<'a> {
    fn done(&self) -> bool {
        self.at >= self.words.len()
    }

    fn word(&mut self, op: Op, what: &str) -> Result<u32> {
        if let Some(&word) = self.words.get(self.at) {
            self.at += 1;
            Ok(word)
        } else {
            Err(anyhow!(
                "{:?} has a short operand list: missing {} at operand {}",
                op,
                what,
                self.at
            ))
        }
    }

    fn read(&mut self, kind: TokenKind, op: Op, out: &mut Vec<Token>) -> Result<()> {
        let token = match kind {
            TokenKind::Const => Token::Const(self.word(op, "literal")?),
            TokenKind::Uint => Token::Uint(self.word(op, "literal")?),
            TokenKind::Int => Token::Int(self.word(op, "literal")? as i32),
            TokenKind::Float => Token::Float(f32::from_bits(self.word(op, "literal")?)),
            TokenKind::Ref => Token::Ref(self.word(op, "reference")?),
            TokenKind::String => Token::String(self.string(op)?),
        };
        out.push(token);
        Ok(())
    }

    /// UTF-8 characters packed four per word, low byte first, nul terminated.
    /// The terminating word is consumed whole.
    fn string(&mut self, op: Op) -> Result<String> {
        let mut bytes = Vec::new();
        while self.at < self.words.len() {
            let word = self.words[self.at];
            self.at += 1;
            for byte in word.to_le_bytes() {
                if byte == 0 {
                    return String::from_utf8(bytes)
                        .map_err(|_| anyhow!("{:?} has a non-UTF-8 string operand", op));
                }
                bytes.push(byte);
            }
        }
        Err(anyhow!("{:?} has an unterminated string operand", op))
    }

    fn finish(&self, op: Op, schema: &OpSchema) -> Result<()> {
        if !schema.lax && self.at < self.words.len() {
            bail!(
                "{:?} has {} extra operand words",
                op,
                self.words.len() - self.at
            );
        }
        Ok(())
    }
}

/// Decode a whole module into instructions.
pub fn decode_module(bin: &SpirvBinary) -> Result<Vec<Instruction>> {
    let mut insts = Vec::new();
    let mut instrs = bin.instrs()?;
    while let Some(instr) = instrs.next()? {
        let op = instr.op()?;
        let inst = Instruction::decode(op, instr.operands())
            .map_err(|e| anyhow!("at instruction {}: {}", insts.len(), e))?;
        insts.push(inst);
    }
    Ok(insts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::InstructionBuilder;
    use pretty_assertions::assert_eq;

    #[test]
    fn typed_results_lead_the_operands() {
        let words = InstructionBuilder::new(Op::FAdd).push(2).push(5).push(3).push(4).build();
        let inst = Instruction::decode(Op::FAdd, &words[1..]).unwrap();
        assert_eq!(inst.result_type_id(), 2);
        assert_eq!(inst.result_id(), 5);
        assert_eq!(inst.ref_at(2).unwrap(), 3);
        assert_eq!(inst.ref_at(3).unwrap(), 4);
    }

    #[test]
    fn strings_consume_whole_words() {
        let words = InstructionBuilder::new(Op::Name).push(7).push_str("xyz").build();
        let inst = Instruction::decode(Op::Name, &words[1..]).unwrap();
        assert_eq!(inst.str_at(1).unwrap(), "xyz");
    }

    #[test]
    fn short_operand_list_is_reported() {
        let err = Instruction::decode(Op::Store, &[1]).unwrap_err();
        assert!(err.to_string().contains("short operand list"));
    }

    #[test]
    fn extra_words_are_reported() {
        let err = Instruction::decode(Op::Branch, &[1, 2]).unwrap_err();
        assert!(err.to_string().contains("extra operand words"));
    }

    #[test]
    fn unterminated_string_is_reported() {
        let words = [u32::from_le_bytes(*b"abcd")];
        let err = Instruction::decode(Op::ExtInstImport, &[9, words[0]]).unwrap_err();
        assert!(err.to_string().contains("unterminated string"));
    }

    #[test]
    fn repeating_tails_loop() {
        // OpPhi %ty %res (%val %label)x2
        let words = InstructionBuilder::new(Op::Phi)
            .push_list(&[1, 2, 3, 4, 5, 6])
            .build();
        let inst = Instruction::decode(Op::Phi, &words[1..]).unwrap();
        assert_eq!(inst.operands().len(), 6);
    }
}

use anyhow::bail;
use std::iter::FromIterator;

use crate::error::Result;
use crate::instr::Instrs;

pub const MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone)]
pub struct SpirvHeader {
    pub magic: u32,
    pub version: u32,
    pub generator: u32,
    pub bound: u32,
    pub schema: u32,
}
impl Default for SpirvHeader {
    fn default() -> Self {
        SpirvHeader {
            magic: MAGIC,
            version: 0x0001_0000,
            generator: 0,
            bound: 0,
            schema: 0,
        }
    }
}
impl SpirvHeader {
    pub fn new(version: u32, bound: u32) -> Self {
        SpirvHeader {
            version,
            bound,
            ..Default::default()
        }
    }
    pub fn words(&self) -> [u32; 5] {
        [
            self.magic,
            self.version,
            self.generator,
            self.bound,
            self.schema,
        ]
    }
}

/// SPIR-V program binary.
#[derive(Debug, Default, Clone)]
pub struct SpirvBinary(Vec<u32>);
impl From<Vec<u32>> for SpirvBinary {
    fn from(x: Vec<u32>) -> Self {
        SpirvBinary(x)
    }
}
impl From<&[u32]> for SpirvBinary {
    fn from(x: &[u32]) -> Self {
        SpirvBinary(x.to_owned())
    }
}
impl FromIterator<u32> for SpirvBinary {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        SpirvBinary(iter.into_iter().collect::<Vec<u32>>())
    }
}

impl SpirvBinary {
    /// Load a binary from raw bytes. The endianness of the module is inferred
    /// from the magic number in the first word.
    pub fn from_bytes(x: &[u8]) -> Result<SpirvBinary> {
        if x.len() < 4 || x.len() % 4 != 0 {
            bail!("not a SPIR-V module");
        }
        let from_bytes = match x[0] {
            0x03 => u32::from_le_bytes,
            0x07 => u32::from_be_bytes,
            _ => bail!("not a SPIR-V module"),
        };
        let out = x
            .chunks_exact(4)
            .map(|x| from_bytes(bytemuck::pod_read_unaligned::<[u8; 4]>(x)))
            .collect::<SpirvBinary>();
        match out.0.first() {
            Some(&magic) if magic == MAGIC => Ok(out),
            _ => bail!("not a SPIR-V module"),
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.0
    }
    pub fn into_words(self) -> Vec<u32> {
        self.0
    }

    pub fn header(&self) -> Result<SpirvHeader> {
        if self.0.len() < 5 {
            bail!("not a SPIR-V module");
        }
        let header = &self.0[..5];
        Ok(SpirvHeader {
            magic: header[0],
            version: header[1],
            generator: header[2],
            bound: header[3],
            schema: header[4],
        })
    }

    /// Iterate the raw instructions following the 5-word header.
    pub fn instrs(&self) -> Result<Instrs> {
        const HEADER_LEN: usize = 5;
        if self.0.len() < HEADER_LEN {
            bail!("not a SPIR-V module");
        }
        Instrs::new(&self.words()[HEADER_LEN..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endianness_is_inferred_from_magic() {
        let le: Vec<u8> = MAGIC
            .to_le_bytes()
            .iter()
            .chain([0u8; 16].iter())
            .copied()
            .collect();
        let be: Vec<u8> = MAGIC
            .to_be_bytes()
            .iter()
            .chain([0u8; 16].iter())
            .copied()
            .collect();
        assert_eq!(SpirvBinary::from_bytes(&le).unwrap().words()[0], MAGIC);
        assert_eq!(SpirvBinary::from_bytes(&be).unwrap().words()[0], MAGIC);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(SpirvBinary::from_bytes(&[0xff, 0xfe, 0xfd, 0xfc]).is_err());
        assert!(SpirvBinary::from_bytes(&[0x03, 0x02]).is_err());
    }
}

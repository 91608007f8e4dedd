//! The shader binding table.
//!
//! An rgen program receives the table as the reserved
//! `@shader-binding-table` input: three record groups (miss, hit group,
//! callable), each record naming shader module paths plus optional
//! per-record buffer values. The program loads the referenced modules as
//! substages; this module only parses the table's external form.
use anyhow::bail;
use spvsim_value::ty::TypeArena;
use spvsim_value::value::{Value, ValueMap};

use crate::error::{anyhow, Result};

pub const SBT_NAME: &str = "@shader-binding-table";

/// One shader reference plus the record values handed to it.
#[derive(Clone, Debug)]
pub struct ShaderSpec {
    pub path: String,
    pub record: ValueMap,
}

/// A hit group: up to three shaders sharing one record.
#[derive(Clone, Debug, Default)]
pub struct HitRecordSpec {
    pub closest: Option<String>,
    pub any: Option<String>,
    pub intersection: Option<String>,
    pub record: ValueMap,
}

/// The parsed table. Indexed by
/// `instance_sbt_offset + ray_offset + geometry_index * stride` for hit
/// groups and by `miss_index` for miss shaders.
#[derive(Clone, Debug, Default)]
pub struct ShaderBindingTable {
    pub misses: Vec<ShaderSpec>,
    pub hits: Vec<HitRecordSpec>,
    pub callables: Vec<ShaderSpec>,
}

fn field<'a>(
    arena: &TypeArena,
    value: &'a Value,
    name: &str,
) -> Result<Option<&'a Value>> {
    let agg = match value {
        Value::Struct(agg) => agg,
        _ => bail!("shader binding table entries must be structs"),
    };
    let names = arena.get(agg.ty()).names();
    Ok(names
        .iter()
        .position(|n| n == name)
        .and_then(|i| agg.get(i).ok()))
}

fn string_of(value: &Value, what: &str) -> Result<String> {
    match value {
        Value::String(_, s) => Ok(s.clone()),
        _ => Err(anyhow!("shader binding table field \"{}\" must be a string", what)),
    }
}

fn record_of(arena: &TypeArena, value: Option<&Value>) -> Result<ValueMap> {
    let mut out = ValueMap::new();
    if let Some(Value::Struct(agg)) = value {
        let names = arena.get(agg.ty()).names().to_vec();
        for (i, name) in names.iter().enumerate() {
            out.insert(name.clone(), agg.get(i)?.clone());
        }
    }
    Ok(out)
}

fn shader_specs(arena: &TypeArena, group: Option<&Value>, what: &str) -> Result<Vec<ShaderSpec>> {
    let mut out = Vec::new();
    if let Some(group) = group {
        let arr = group
            .as_aggregate()
            .map_err(|_| anyhow!("shader binding table group \"{}\" must be an array", what))?;
        for entry in arr.elements() {
            let path = field(arena, entry, "shader")?
                .ok_or_else(|| anyhow!("{} record is missing its \"shader\" field", what))?;
            out.push(ShaderSpec {
                path: string_of(path, "shader")?,
                record: record_of(arena, field(arena, entry, "record")?)?,
            });
        }
    }
    Ok(out)
}

impl ShaderBindingTable {
    /// Read the table from its external struct form.
    pub fn parse(arena: &TypeArena, value: &Value) -> Result<ShaderBindingTable> {
        let mut table = ShaderBindingTable {
            misses: shader_specs(arena, field(arena, value, "miss")?, "miss")?,
            callables: shader_specs(arena, field(arena, value, "callable")?, "callable")?,
            ..Default::default()
        };
        if let Some(group) = field(arena, value, "hit_group")? {
            let arr = group
                .as_aggregate()
                .map_err(|_| anyhow!("shader binding table group \"hit_group\" must be an array"))?;
            for entry in arr.elements() {
                let mut spec = HitRecordSpec {
                    record: record_of(arena, field(arena, entry, "record")?)?,
                    ..Default::default()
                };
                if let Some(path) = field(arena, entry, "closest")? {
                    spec.closest = Some(string_of(path, "closest")?);
                }
                if let Some(path) = field(arena, entry, "any")? {
                    spec.any = Some(string_of(path, "any")?);
                }
                if let Some(path) = field(arena, entry, "intersection")? {
                    spec.intersection = Some(string_of(path, "intersection")?);
                }
                table.hits.push(spec);
            }
        }
        Ok(table)
    }
}

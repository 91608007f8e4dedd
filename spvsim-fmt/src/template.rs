//! Input template generation.
//!
//! A template lists every input the program expects. Without `--default`
//! each primitive becomes a `<type>` stub; with it, the current default
//! values print instead.
use spvsim_value::ty::{TypeArena, TypeBase};
use spvsim_value::value::{Value, ValueMap};

use crate::error::Result;
use crate::Format;

fn stub_of(arena: &TypeArena, value: &Value) -> serde_json::Value {
    match value {
        Value::Primitive(p) => {
            let name = match arena.get(p.ty()).base() {
                TypeBase::Float => "<float>",
                TypeBase::Uint => "<uint>",
                TypeBase::Int => "<int>",
                TypeBase::Bool => "<bool>",
                _ => "<value>",
            };
            serde_json::Value::String(name.to_owned())
        }
        Value::String(..) => serde_json::Value::String("<string>".to_owned()),
        Value::Array(agg) | Value::Struct(agg)
            if arena.get(agg.ty()).base() == TypeBase::Array =>
        {
            serde_json::Value::Array(agg.elements().iter().map(|e| stub_of(arena, e)).collect())
        }
        Value::Struct(agg) | Value::Array(agg) => {
            let names = arena.get(agg.ty()).names();
            let mut map = serde_json::Map::new();
            for (i, e) in agg.elements().iter().enumerate() {
                let name = names
                    .get(i)
                    .filter(|n| !n.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("field{}", i));
                map.insert(name, stub_of(arena, e));
            }
            serde_json::Value::Object(map)
        }
        Value::CoopMatrix(mat) => serde_json::Value::Array(
            mat.elements().iter().map(|e| stub_of(arena, e)).collect(),
        ),
        _ => serde_json::Value::String("<value>".to_owned()),
    }
}

/// Render an input template. With `defaults` the current values print;
/// otherwise type stubs do.
pub fn render(
    format: Format,
    arena: &TypeArena,
    inputs: &ValueMap,
    defaults: bool,
    indent: usize,
) -> Result<String> {
    if defaults {
        return format.print(arena, inputs, indent);
    }
    let mut doc = serde_json::Map::new();
    for (name, value) in inputs {
        doc.insert(name.clone(), stub_of(arena, value));
    }
    let doc = serde_json::Value::Object(doc);
    let out = match format {
        Format::Yaml => {
            if inputs.is_empty() {
                String::new()
            } else {
                serde_yaml::to_string(&doc)?
            }
        }
        Format::Json => {
            let mut out = serde_json::to_string_pretty(&doc)?;
            out.push('\n');
            out
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvsim_value::ty::Type;
    use spvsim_value::value::{Aggregate, Primitive};

    #[test]
    fn stubs_follow_the_type() {
        let mut arena = TypeArena::new();
        let mut inputs = ValueMap::new();
        inputs.insert(
            "x".to_owned(),
            Value::Primitive(Primitive::float(&arena, 0.0)),
        );
        let v2 = arena.intern(Type::array(2, arena.u32()));
        inputs.insert(
            "v".to_owned(),
            Value::Array(Aggregate::new(
                v2,
                vec![
                    Value::Primitive(Primitive::uint(&arena, 0)),
                    Value::Primitive(Primitive::uint(&arena, 0)),
                ],
            )),
        );
        let got = render(Format::Yaml, &arena, &inputs, false, 2).unwrap();
        assert!(got.contains("<float>"));
        assert!(got.contains("<uint>"));
    }

    #[test]
    fn defaults_print_the_values() {
        let arena = TypeArena::new();
        let mut inputs = ValueMap::new();
        inputs.insert(
            "x".to_owned(),
            Value::Primitive(Primitive::float(&arena, 1.5)),
        );
        let got = render(Format::Yaml, &arena, &inputs, true, 2).unwrap();
        assert!(got.contains("1.5"));
    }
}

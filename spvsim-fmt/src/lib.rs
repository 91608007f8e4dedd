//! Value input and output in YAML and JSON.
//!
//! The interpreter's values convert to and from the serde data models;
//! the scanning and emitting itself is serde_yaml's and serde_json's job.
//! A format is picked by file extension with a command-line fallback.
use anyhow::bail;
use spvsim_value::ty::{Type, TypeArena, TypeBase};
use spvsim_value::value::{Aggregate, Primitive, Value, ValueMap};

pub mod template;

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, Error, Result};
}
use error::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Format> {
        match name {
            "yaml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }

    /// Pick a format from a file name's extension, falling back to the
    /// given default when the extension is not recognised.
    pub fn for_file(file_name: &str, fallback: Format) -> Format {
        file_name
            .rsplit('.')
            .next()
            .and_then(Format::from_name)
            .unwrap_or(fallback)
    }

    /// Parse a whole input document into the map.
    pub fn parse_str(
        &self,
        arena: &mut TypeArena,
        text: &str,
        into: &mut ValueMap,
    ) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        match self {
            Format::Yaml => {
                let doc: serde_yaml::Value = serde_yaml::from_str(text)?;
                parse_document(arena, yaml_to_json(doc)?, into)
            }
            Format::Json => {
                let doc: serde_json::Value = serde_json::from_str(text)?;
                parse_document(arena, doc, into)
            }
        }
    }

    /// Parse one `KEY=VAL` pair, the value in this format's syntax.
    pub fn parse_set(&self, arena: &mut TypeArena, keyval: &str, into: &mut ValueMap) -> Result<()> {
        let eq = keyval
            .find('=')
            .ok_or_else(|| anyhow!("--set expects KEY=VAL, got \"{}\"", keyval))?;
        let (key, val) = keyval.split_at(eq);
        let val = &val[1..];
        let parsed = match self {
            Format::Yaml => yaml_to_json(serde_yaml::from_str(val)?)?,
            Format::Json => serde_json::from_str(val)?,
        };
        let value = from_serde(arena, parsed)?;
        add_to_map(into, key.trim(), value)
    }

    /// Print the map as a document. `indent` is the indent width in
    /// spaces; YAML output always indents by two.
    pub fn print(&self, arena: &TypeArena, vars: &ValueMap, indent: usize) -> Result<String> {
        let mut doc = serde_json::Map::new();
        for (name, value) in vars {
            doc.insert(name.clone(), to_serde(arena, value)?);
        }
        let doc = serde_json::Value::Object(doc);
        match self {
            Format::Yaml => {
                if vars.is_empty() {
                    return Ok(String::new());
                }
                Ok(serde_yaml::to_string(&doc)?)
            }
            Format::Json => {
                let indent_bytes = vec![b' '; indent.max(1)];
                let mut out = Vec::new();
                let fmt =
                    serde_json::ser::PrettyFormatter::with_indent(&indent_bytes);
                let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
                serde::Serialize::serialize(&doc, &mut ser)?;
                out.push(b'\n');
                Ok(String::from_utf8(out)?)
            }
        }
    }
}

/// Add a key-value pair, rejecting duplicate names.
pub fn add_to_map(vars: &mut ValueMap, key: &str, value: Value) -> Result<()> {
    if vars.contains_key(key) {
        bail!(
            "attempt to add variable \"{}\" when one by the same name already exists",
            key
        );
    }
    vars.insert(key.to_owned(), value);
    Ok(())
}

fn parse_document(
    arena: &mut TypeArena,
    doc: serde_json::Value,
    into: &mut ValueMap,
) -> Result<()> {
    let map = match doc {
        serde_json::Value::Object(map) => map,
        _ => bail!("the input file root must be a mapping of variable names"),
    };
    for (key, raw) in map {
        let value = from_serde(arena, raw)
            .map_err(|e| anyhow!("variable \"{}\": {}", key, e))?;
        add_to_map(into, &key, value)?;
    }
    Ok(())
}

/// Normalise a YAML document into the JSON data model.
fn yaml_to_json(value: serde_yaml::Value) -> Result<serde_json::Value> {
    use serde_yaml::Value as Y;
    let out = match value {
        Y::Null => serde_json::Value::Null,
        Y::Bool(b) => serde_json::Value::Bool(b),
        Y::Number(n) => {
            if let Some(u) = n.as_u64() {
                serde_json::Value::Number(u.into())
            } else if let Some(i) = n.as_i64() {
                serde_json::Value::Number(i.into())
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                match serde_json::Number::from_f64(f) {
                    Some(num) => serde_json::Value::Number(num),
                    // Infinities and NaN ride through as strings.
                    None => serde_json::Value::String(special_float_str(f as f32).to_owned()),
                }
            }
        }
        Y::String(s) => serde_json::Value::String(s),
        Y::Sequence(seq) => serde_json::Value::Array(
            seq.into_iter().map(yaml_to_json).collect::<Result<Vec<_>>>()?,
        ),
        Y::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    Y::String(s) => s,
                    Y::Number(n) => n.to_string(),
                    Y::Bool(b) => b.to_string(),
                    _ => bail!("mapping keys must be scalars"),
                };
                out.insert(key, yaml_to_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value)?,
    };
    Ok(out)
}

fn special_float_str(f: f32) -> &'static str {
    if f.is_nan() {
        ".nan"
    } else if f > 0.0 {
        ".inf"
    } else {
        "-.inf"
    }
}

fn special_float_of(s: &str) -> Option<f32> {
    match s {
        ".inf" | ".Inf" | "inf" => Some(f32::INFINITY),
        "-.inf" | "-.Inf" | "-inf" => Some(f32::NEG_INFINITY),
        ".nan" | ".NAN" | "nan" => Some(f32::NAN),
        _ => None,
    }
}

/// Turn a parsed document value into a runtime value.
pub fn from_serde(arena: &mut TypeArena, raw: serde_json::Value) -> Result<Value> {
    use serde_json::Value as J;
    let out = match raw {
        J::Null => bail!("null is not a value"),
        J::Bool(b) => Value::Primitive(Primitive::boolean(arena, b)),
        J::Number(n) => {
            if let Some(u) = n.as_u64() {
                if u > u64::from(u32::MAX) {
                    bail!("value {} is too big to fit in a 32-bit uint", u);
                }
                Value::Primitive(Primitive::uint(arena, u as u32))
            } else if let Some(i) = n.as_i64() {
                if i < i64::from(i32::MIN) {
                    bail!("value {} is too small to fit in a 32-bit int", i);
                }
                Value::Primitive(Primitive::int(arena, i as i32))
            } else {
                Value::Primitive(Primitive::float(arena, n.as_f64().unwrap_or(0.0) as f32))
            }
        }
        J::String(s) => match special_float_of(&s) {
            Some(f) => Value::Primitive(Primitive::float(arena, f)),
            None => Value::String(arena.string(), s),
        },
        J::Array(seq) => {
            let elements = seq
                .into_iter()
                .map(|e| from_serde(arena, e))
                .collect::<Result<Vec<_>>>()?;
            construct_list(arena, elements)?
        }
        J::Object(map) => {
            let mut names = Vec::new();
            let mut elements = Vec::new();
            for (key, v) in map {
                names.push(key);
                elements.push(from_serde(arena, v)?);
            }
            let fields = elements.iter().map(Value::ty).collect();
            let ty = arena.intern(Type::structure_named(fields, names));
            Value::Struct(Aggregate::new(ty, elements))
        }
    };
    Ok(out)
}

/// Form an array from parsed elements, unifying their types where the
/// union exists. Heterogeneous aggregates (e.g. node structs whose inner
/// arrays differ in length) keep each element's own type under the first
/// element's array type.
fn construct_list(arena: &mut TypeArena, elements: Vec<Value>) -> Result<Value> {
    let el_ty = match elements.as_slice() {
        [] => arena.u32(),
        [first, rest @ ..] => {
            let mut unified = Ok(first.ty());
            for e in rest {
                unified = match unified {
                    Ok(ty) => arena.union_of(ty, e.ty()),
                    err => err,
                };
            }
            match unified {
                Ok(ty) => ty,
                Err(_) => {
                    if rest.iter().all(|e| {
                        arena.get(e.ty()).base() == arena.get(first.ty()).base()
                    }) {
                        first.ty()
                    } else {
                        bail!("element parsed of incompatible type with other array elements");
                    }
                }
            }
        }
    };
    let ty = arena.intern(Type::array(elements.len() as u32, el_ty));
    // Convert each element to the unified type where it differs.
    let mut converted = Vec::with_capacity(elements.len());
    for e in elements {
        if arena.eq(e.ty(), el_ty) || !arena.get(el_ty).is_primitive() {
            converted.push(e);
        } else {
            let mut slot = Value::construct(arena, el_ty)?;
            slot.copy_from(&e, arena)?;
            converted.push(slot);
        }
    }
    Ok(Value::Array(Aggregate::new(ty, converted)))
}

/// Turn a runtime value into the serde data model for printing.
pub fn to_serde(arena: &TypeArena, value: &Value) -> Result<serde_json::Value> {
    use serde_json::Value as J;
    let out = match value {
        Value::Primitive(p) => match arena.get(p.ty()).base() {
            TypeBase::Float => {
                let f = p.f32_val();
                // Round-trip through the shortest f32 rendering so the
                // f64 widening does not smear digits.
                match serde_json::Number::from_f64(format!("{}", f).parse().unwrap_or(f as f64)) {
                    Some(n) => J::Number(n),
                    None => J::String(special_float_str(f).to_owned()),
                }
            }
            TypeBase::Int => J::Number(p.i32_val().into()),
            TypeBase::Bool => J::Bool(p.bool_val()),
            _ => J::Number(p.u32_val().into()),
        },
        Value::String(_, s) => J::String(s.clone()),
        Value::Array(agg) | Value::Struct(agg)
            if arena.get(agg.ty()).base() == TypeBase::Array =>
        {
            J::Array(
                agg.elements()
                    .iter()
                    .map(|e| to_serde(arena, e))
                    .collect::<Result<Vec<_>>>()?,
            )
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
                map.insert(name, to_serde(arena, e)?);
            }
            J::Object(map)
        }
        Value::CoopMatrix(mat) => J::Array(
            mat.elements()
                .iter()
                .map(|e| to_serde(arena, e))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Pointer(p) => {
            let mut seq = vec![J::Number(p.head().into())];
            seq.extend(p.indices().iter().map(|&i| J::Number(i.into())));
            J::Array(seq)
        }
        _ => bail!("cannot externalize this value; convert it to its struct form first"),
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(format: Format, text: &str) {
        let mut arena = TypeArena::new();
        let mut vars = ValueMap::new();
        format.parse_str(&mut arena, text, &mut vars).unwrap();
        let printed = format.print(&arena, &vars, 2).unwrap();
        let mut again = ValueMap::new();
        format.parse_str(&mut arena, &printed, &mut again).unwrap();
        assert_eq!(vars.len(), again.len());
        for (name, value) in &vars {
            assert!(
                again[name].equals(value, &arena),
                "{} did not round-trip: {} vs {}",
                name,
                value.display(&arena),
                again[name].display(&arena)
            );
        }
    }

    #[test]
    fn yaml_roundtrip() {
        roundtrip(
            Format::Yaml,
            "x: 3.5\nv: [1.0, 2.0, 3.0]\nflag: true\nn: -7\ns:\n  a: 1\n  b: [2, 3]\n",
        );
    }

    #[test]
    fn json_roundtrip() {
        roundtrip(
            Format::Json,
            r#"{"x": 3.5, "v": [1.5, 2.5], "flag": false, "nested": {"k": 9}}"#,
        );
    }

    #[test]
    fn awkward_keys_roundtrip() {
        roundtrip(
            Format::Yaml,
            "\"with space\": 1\n\"0starts\": 2\n\"co:lon\": 3\n\"qu\\\"ote\": 4\n\"back\\\\slash\": 5\n",
        );
        roundtrip(
            Format::Json,
            r#"{"with space": 1, "0starts": 2, "co:lon": 3, "qu\"ote": 4, "back\\slash": 5}"#,
        );
    }

    #[test]
    fn number_parsing_round_trips() {
        let mut arena = TypeArena::new();
        for x in [0i32, 1, -1, i32::MIN, i32::MAX, 123456, -98765] {
            let text = format!("v: {}", x);
            let mut vars = ValueMap::new();
            Format::Yaml.parse_str(&mut arena, &text, &mut vars).unwrap();
            let got = vars["v"].as_primitive().unwrap().i32_val();
            assert_eq!(got, x);
        }
        for x in [0.0f32, 1.5, -2.25, 3.402_823_5e38, 1.1754944e-38, 0.1] {
            let text = format!("v: {}", x);
            let mut vars = ValueMap::new();
            Format::Yaml.parse_str(&mut arena, &text, &mut vars).unwrap();
            let got = vars["v"].as_primitive().unwrap().f32_val();
            assert!(
                spvsim_value::util::eq_float(got, x, 6),
                "{} parsed as {}",
                x,
                got
            );
        }
        for x in [u32::MAX, 0, 7] {
            let text = format!("v: {}", x);
            let mut vars = ValueMap::new();
            Format::Yaml.parse_str(&mut arena, &text, &mut vars).unwrap();
            assert_eq!(vars["v"].as_primitive().unwrap().u32_val(), x);
        }
    }

    #[test]
    fn arrays_unify_their_element_type() {
        let mut arena = TypeArena::new();
        let mut vars = ValueMap::new();
        // A mixed int/float sequence unifies to float.
        Format::Yaml
            .parse_str(&mut arena, "v: [1, 2.5, 3]", &mut vars)
            .unwrap();
        let arr = vars["v"].as_aggregate().unwrap();
        for e in arr.elements() {
            assert_eq!(arena.get(e.ty()).base(), TypeBase::Float);
        }
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut vars = ValueMap::new();
        let arena = TypeArena::new();
        add_to_map(
            &mut vars,
            "x",
            Value::Primitive(Primitive::uint(&arena, 1)),
        )
        .unwrap();
        assert!(add_to_map(&mut vars, "x", Value::Primitive(Primitive::uint(&arena, 2))).is_err());
    }

    #[test]
    fn set_pairs_parse() {
        let mut arena = TypeArena::new();
        let mut vars = ValueMap::new();
        Format::Yaml
            .parse_set(&mut arena, "x=3.5", &mut vars)
            .unwrap();
        Format::Yaml
            .parse_set(&mut arena, "v=[1.0, 2.0]", &mut vars)
            .unwrap();
        assert_eq!(vars["x"].as_primitive().unwrap().f32_val(), 3.5);
        assert_eq!(vars["v"].as_aggregate().unwrap().len(), 2);
    }

    #[test]
    fn special_floats_survive() {
        roundtrip(Format::Yaml, "a: .inf\nb: -.inf\nc: .nan\n");
        roundtrip(Format::Json, r#"{"a": ".inf", "c": ".nan"}"#);
    }

    #[test]
    fn format_detection() {
        assert_eq!(Format::for_file("out.json", Format::Yaml), Format::Json);
        assert_eq!(Format::for_file("out.yaml", Format::Json), Format::Yaml);
        assert_eq!(Format::for_file("out.txt", Format::Json), Format::Json);
        assert_eq!(Format::for_file("-", Format::Yaml), Format::Yaml);
    }
}

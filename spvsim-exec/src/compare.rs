//! Matching of externally provided names to interface variables.
//!
//! Inputs match a variable either by string equality with its name or by a
//! synthetic locator: `@locationN` for in/out variables, `@bindingN` or
//! `@setM bindingN` for buffers. A leading `@` in a real variable name is
//! escaped by doubling it.
use spirv::StorageClass;
use spvsim_value::Variable;

#[derive(Debug)]
pub struct VarSelector {
    name: String,
    by_name: bool,
    binding: Option<u32>,
    set: Option<u32>,
    buffer: bool,
}

impl VarSelector {
    pub fn new(name: &str) -> VarSelector {
        let mut sel = VarSelector {
            name: name.to_owned(),
            by_name: true,
            binding: None,
            set: None,
            buffer: false,
        };
        let bytes = name.as_bytes();
        if bytes.first() == Some(&b'@') && bytes.get(1) != Some(&b'@') {
            sel.by_name = false;
            let mut rest = &name[1..];
            loop {
                if let Some((value, tail)) = parse_descriptor(rest, "location") {
                    sel.binding = Some(value);
                    sel.buffer = false;
                    rest = tail;
                } else if let Some((value, tail)) = parse_descriptor(rest, "binding") {
                    sel.binding = Some(value);
                    sel.buffer = true;
                    rest = tail;
                } else if let Some((value, tail)) = parse_descriptor(rest, "set") {
                    sel.set = Some(value);
                    rest = tail;
                } else {
                    if !rest.trim().is_empty() {
                        // Unrecognized locator; fall back to literal names.
                        sel.by_name = true;
                    }
                    break;
                }
                rest = rest.trim_start();
            }
        }
        sel
    }

    pub fn matches(&self, var: &Variable) -> bool {
        if self.by_name {
            mangle(var.name()) == self.name
        } else {
            var.binding() == self.binding
                && (self.set.is_none() || var.descriptor_set() == self.set)
                && self.buffer == is_buffer(var)
        }
    }
}

fn parse_descriptor<'a>(from: &'a str, key: &str) -> Option<(u32, &'a str)> {
    let rest = from.strip_prefix(key)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let value = digits.parse().ok()?;
    Some((value, &rest[digits.len()..]))
}

fn is_buffer(var: &Variable) -> bool {
    !matches!(
        var.storage_class(),
        StorageClass::Input | StorageClass::Output
    )
}

/// External spelling of a variable name: a leading `@` doubles.
pub fn mangle(name: &str) -> String {
    if name.starts_with('@') {
        format!("@{}", name)
    } else {
        name.to_owned()
    }
}

/// The synthetic locator used when a variable carries no name.
pub fn synthetic_name(var: &Variable) -> String {
    match (var.descriptor_set(), var.binding()) {
        (Some(set), Some(binding)) => format!("@set{} binding{}", set, binding),
        (None, Some(n)) if is_buffer(var) => format!("@binding{}", n),
        (None, Some(n)) => format!("@location{}", n),
        _ => mangle(var.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvsim_value::value::{Primitive, Value};
    use spvsim_value::TypeArena;

    fn var_with(name: &str, binding: Option<u32>, set: Option<u32>) -> Variable {
        let arena = TypeArena::new();
        let mut var = Variable::make_spec_const(Value::Primitive(Primitive::uint(&arena, 0)));
        var.set_name(name.to_owned());
        if let Some(b) = binding {
            var.set_binding(b);
        }
        if let Some(s) = set {
            var.set_descriptor_set(s);
        }
        var
    }

    #[test]
    fn matches_by_name() {
        let var = var_with("color", None, None);
        assert!(VarSelector::new("color").matches(&var));
        assert!(!VarSelector::new("colour").matches(&var));
    }

    #[test]
    fn matches_by_binding() {
        // Spec constants live in push-constant storage, which is a buffer,
        // so the binding locator applies and the location one does not.
        let var = var_with("", Some(3), None);
        assert!(VarSelector::new("@binding3").matches(&var));
        assert!(!VarSelector::new("@location3").matches(&var));
    }

    #[test]
    fn matches_by_set_and_binding() {
        let var = var_with("", Some(2), Some(1));
        assert!(VarSelector::new("@set1 binding2").matches(&var));
        assert!(!VarSelector::new("@set0 binding2").matches(&var));
    }

    #[test]
    fn doubled_at_escapes() {
        let var = var_with("@weird", None, None);
        assert!(VarSelector::new("@@weird").matches(&var));
    }
}

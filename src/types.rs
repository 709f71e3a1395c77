// Copyright 2025 Cornell University
// released under MIT License

use rustc_hash::FxHashMap;
use std::fmt;

use crate::errors::{CompileResult, TypeError};

/// Bit width of an integer type
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bits(self) -> u32 {
        match self {
            IntWidth::W8 => 8,
            IntWidth::W16 => 16,
            IntWidth::W32 => 32,
            IntWidth::W64 => 64,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(IntWidth::W8),
            16 => Some(IntWidth::W16),
            32 => Some(IntWidth::W32),
            64 => Some(IntWidth::W64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int { signed: bool, width: IntWidth },
    Float32,
    Float64,
    /// Strings are stored as bounded character arrays
    Str,
    Array {
        elem: Box<Type>,
        /// Maximum number of elements
        bound: u32,
        /// `true` when the array carries a shadow length
        dynamic: bool,
    },
    /// Refers to a `StructDef` in the `StructRegistry` by name
    Struct(String),
}

impl Type {
    pub fn int32() -> Self {
        Type::Int {
            signed: true,
            width: IntWidth::W32,
        }
    }

    pub fn int(signed: bool, width: IntWidth) -> Self {
        Type::Int { signed, width }
    }

    pub fn fixed_array(elem: Type, bound: u32) -> Self {
        Type::Array {
            elem: Box::new(elem),
            bound,
            dynamic: false,
        }
    }

    pub fn dynamic_array(elem: Type, bound: u32) -> Self {
        Type::Array {
            elem: Box::new(elem),
            bound,
            dynamic: true,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float32 | Type::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_float()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Type::Bool | Type::Int { .. } | Type::Float32 | Type::Float64
        )
    }

    /// Checks whether a value of type `other` can be stored in a variable of
    /// type `self` without an explicit conversion.
    /// Integers may widen (same signedness, or unsigned into a strictly wider
    /// signed type), floats accept integers and narrower floats.
    pub fn accepts(&self, other: &Type) -> bool {
        match (self, other) {
            (
                Type::Int {
                    signed: s1,
                    width: w1,
                },
                Type::Int {
                    signed: s2,
                    width: w2,
                },
            ) => (s1 == s2 && w1 >= w2) || (*s1 && !*s2 && w1 > w2),
            (Type::Float64, t) => t.is_numeric(),
            (Type::Float32, Type::Float32) => true,
            (Type::Float32, Type::Int { width, .. }) => *width <= IntWidth::W16,
            (Type::Str, Type::Str) => true,
            (
                Type::Array { elem: e1, .. },
                Type::Array { elem: e2, .. },
            ) => e1 == e2,
            (a, b) => a == b,
        }
    }

    /// Parses the textual type notation used in model files:
    /// `bool`, `int8`..`int64`, `uint8`..`uint64`, `float32`, `float64`,
    /// `string`, `T[N]` (fixed), `T[<=N]` and `T[]` (dynamic), and struct names.
    pub fn parse(text: &str, max_array_size: u32) -> Option<Type> {
        let text = text.trim();
        if let Some(prefix) = text.strip_suffix(']') {
            let open = prefix.rfind('[')?;
            let elem = Type::parse(&prefix[..open], max_array_size)?;
            let size = prefix[open + 1..].trim();
            return if size.is_empty() {
                Some(Type::dynamic_array(elem, max_array_size))
            } else if let Some(bound) = size.strip_prefix("<=") {
                Some(Type::dynamic_array(elem, bound.trim().parse().ok()?))
            } else {
                Some(Type::fixed_array(elem, size.parse().ok()?))
            };
        }
        let tpe = match text {
            "bool" | "boolean" => Type::Bool,
            "float32" | "float" => Type::Float32,
            "float64" | "double" => Type::Float64,
            "string" => Type::Str,
            "" => return None,
            other => {
                if let Some(bits) = other.strip_prefix("uint") {
                    Type::int(false, IntWidth::from_bits(bits.parse().ok()?)?)
                } else if let Some(bits) = other.strip_prefix("int") {
                    Type::int(true, IntWidth::from_bits(bits.parse().ok()?)?)
                } else if other
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
                {
                    Type::Struct(other.to_string())
                } else {
                    return None;
                }
            }
        };
        Some(tpe)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int { signed, width } => {
                let prefix = if *signed { "int" } else { "uint" };
                write!(f, "{}{}", prefix, width.bits())
            }
            Type::Float32 => write!(f, "float32"),
            Type::Float64 => write!(f, "float64"),
            Type::Str => write!(f, "string"),
            Type::Array {
                elem,
                bound,
                dynamic,
            } => {
                if *dynamic {
                    write!(f, "{}[<={}]", elem, bound)
                } else {
                    write!(f, "{}[{}]", elem, bound)
                }
            }
            Type::Struct(name) => write!(f, "{}", name),
        }
    }
}

/// A named struct type with ordered fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    name: String,
    fields: Vec<(String, Type)>,
}

impl StructDef {
    pub fn new(name: impl Into<String>, fields: Vec<(String, Type)>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[(String, Type)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }
}

/// A scalar (or array-of-scalar) variable that survives struct flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// Dotted path, e.g. `pose.points.x`
    pub path: String,
    /// Scalar type wrapped once per array level crossed on the way down
    pub tpe: Type,
    /// `true` for the shadow length of a dynamic array
    pub is_length: bool,
}

/// All struct types known to a compilation, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructRegistry {
    defs: Vec<StructDef>,
    by_name: FxHashMap<String, usize>,
}

impl StructRegistry {
    /// Registers a struct. Returns `false` when the name is already taken.
    pub fn add(&mut self, def: StructDef) -> bool {
        if self.by_name.contains_key(def.name()) {
            return false;
        }
        self.by_name.insert(def.name().to_string(), self.defs.len());
        self.defs.push(def);
        true
    }

    pub fn get(&self, name: &str) -> Option<&StructDef> {
        self.by_name.get(name).map(|idx| &self.defs[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructDef> {
        self.defs.iter()
    }

    /// Checks that every struct reference in `tpe` resolves and that no
    /// struct contains itself.
    pub fn check(&self, tpe: &Type) -> CompileResult<()> {
        self.check_helper(tpe, &mut vec![])
    }

    fn check_helper(&self, tpe: &Type, visiting: &mut Vec<String>) -> CompileResult<()> {
        match tpe {
            Type::Array { elem, .. } => self.check_helper(elem, visiting),
            Type::Struct(name) => {
                if visiting.contains(name) {
                    return Err(TypeError::recursive_struct(name).into());
                }
                let def = self
                    .get(name)
                    .ok_or_else(|| TypeError::unknown_type(name))?;
                visiting.push(name.clone());
                for (_, field_tpe) in def.fields() {
                    self.check_helper(field_tpe, visiting)?;
                }
                visiting.pop();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Computes the static set of leaves a variable of type `tpe` named
    /// `path` is flattened into. Arrays of structs become structs of arrays,
    /// and every dynamic array level contributes a `<path>.len` leaf.
    pub fn leaves(&self, path: &str, tpe: &Type) -> CompileResult<Vec<Leaf>> {
        let mut out = vec![];
        self.leaves_helper(path, tpe, &[], &mut out)?;
        Ok(out)
    }

    fn leaves_helper(
        &self,
        path: &str,
        tpe: &Type,
        outer: &[u32],
        out: &mut Vec<Leaf>,
    ) -> CompileResult<()> {
        match tpe {
            Type::Struct(name) => {
                let def = self
                    .get(name)
                    .ok_or_else(|| TypeError::unknown_type(name))?;
                for (field, field_tpe) in def.fields() {
                    self.leaves_helper(&format!("{path}.{field}"), field_tpe, outer, out)?;
                }
            }
            Type::Array {
                elem,
                bound,
                dynamic,
            } => {
                if *dynamic {
                    // both levels would need a `<path>.len` leaf
                    if matches!(elem.as_ref(), Type::Array { dynamic: true, .. }) {
                        return Err(TypeError::mismatch(
                            "array declaration",
                            format!("`{path}` nests a dynamic array directly in a dynamic array"),
                        )
                        .into());
                    }
                    out.push(Leaf {
                        path: format!("{path}.len"),
                        tpe: wrap_in_arrays(Type::int32(), outer),
                        is_length: true,
                    });
                }
                let mut inner = outer.to_vec();
                inner.push(*bound);
                self.leaves_helper(path, elem, &inner, out)?;
            }
            scalar => out.push(Leaf {
                path: path.to_string(),
                tpe: wrap_in_arrays(scalar.clone(), outer),
                is_length: false,
            }),
        }
        Ok(())
    }
}

/// Wraps `tpe` in fixed arrays, outermost bound first.
pub fn wrap_in_arrays(tpe: Type, bounds: &[u32]) -> Type {
    bounds
        .iter()
        .rev()
        .fold(tpe, |acc, bound| Type::fixed_array(acc, *bound))
}

use serde_json::{json, Value};

use crate::plugin::tfplugin6::{schema, Schema, StringKind};

// ─── Types ───────────────────────────────────────────────────────────────────

/// cty type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrType {
    String,
    Number,
    Bool,
    List(Box<AttrType>),
    Set(Box<AttrType>),
    Map(Box<AttrType>),
}

impl AttrType {
    pub fn list_of_strings() -> Self {
        AttrType::List(Box::new(AttrType::String))
    }

    pub fn set_of_strings() -> Self {
        AttrType::Set(Box::new(AttrType::String))
    }

    pub fn map_of_strings() -> Self {
        AttrType::Map(Box::new(AttrType::String))
    }

    /// JSON encoding of the type, as the host expects it in schemas.
    /// e.g. "string", ["list", "string"], ["map", "string"]
    pub fn to_cty(&self) -> Value {
        match self {
            AttrType::String => json!("string"),
            AttrType::Number => json!("number"),
            AttrType::Bool => json!("bool"),
            AttrType::List(elem) => json!(["list", elem.to_cty()]),
            AttrType::Set(elem) => json!(["set", elem.to_cty()]),
            AttrType::Map(elem) => json!(["map", elem.to_cty()]),
        }
    }

    /// List, set or map.
    pub fn is_collection(&self) -> bool {
        matches!(self, AttrType::List(_) | AttrType::Set(_) | AttrType::Map(_))
    }
}

/// One attribute of a block.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: &'static str,
    pub ty: AttrType,
    pub description: &'static str,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
    pub sensitive: bool,
    /// Changing this attribute replaces the resource.
    pub force_new: bool,
    /// Planned when the configuration leaves the attribute unset.
    pub default: Option<Value>,
}

impl Attribute {
    fn new(name: &'static str, ty: AttrType) -> Self {
        Self {
            name,
            ty,
            description: "",
            required: false,
            optional: false,
            computed: false,
            sensitive: false,
            force_new: false,
            default: None,
        }
    }

    pub fn required(name: &'static str, ty: AttrType) -> Self {
        Self {
            required: true,
            ..Self::new(name, ty)
        }
    }

    pub fn optional(name: &'static str, ty: AttrType) -> Self {
        Self {
            optional: true,
            ..Self::new(name, ty)
        }
    }

    /// Optional in configuration, filled in by the provider when unset.
    pub fn optional_computed(name: &'static str, ty: AttrType) -> Self {
        Self {
            optional: true,
            computed: true,
            ..Self::new(name, ty)
        }
    }

    pub fn computed(name: &'static str, ty: AttrType) -> Self {
        Self {
            computed: true,
            ..Self::new(name, ty)
        }
    }

    /// Optional attribute planned as `value` when unset. Declared computed so
    /// the planned default is a legal provider-chosen value.
    pub fn with_default(name: &'static str, ty: AttrType, value: Value) -> Self {
        Self {
            default: Some(value),
            ..Self::optional_computed(name, ty)
        }
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Computed and never settable from configuration.
    pub fn is_computed_only(&self) -> bool {
        self.computed && !self.optional && !self.required
    }

    fn to_proto(&self) -> schema::Attribute {
        schema::Attribute {
            name: self.name.to_string(),
            r#type: self.ty.to_cty().to_string().into_bytes(),
            description: self.description.to_string(),
            required: self.required,
            optional: self.optional,
            computed: self.computed,
            sensitive: self.sensitive,
            description_kind: StringKind::Plain as i32,
            deprecated: false,
        }
    }
}

/// Nesting mode of a nested block (from tfplugin6.proto).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nesting {
    Single,
    List,
    Set,
}

#[derive(Debug, Clone)]
pub struct NestedBlock {
    pub type_name: &'static str,
    pub block: Block,
    pub nesting: Nesting,
    pub min_items: i64,
    pub max_items: i64,
}

/// A schema block: attributes plus nested blocks.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub version: i64,
    pub description: &'static str,
    pub attributes: Vec<Attribute>,
    pub blocks: Vec<NestedBlock>,
}

impl Block {
    pub fn new(description: &'static str, attributes: Vec<Attribute>) -> Self {
        Self {
            version: 0,
            description,
            attributes,
            blocks: vec![],
        }
    }

    /// A resource block. Every resource carries a computed `id`.
    pub fn resource(description: &'static str, attributes: Vec<Attribute>) -> Self {
        let mut all = Vec::with_capacity(attributes.len() + 1);
        all.push(Attribute::computed("id", AttrType::String));
        all.extend(attributes);
        Self::new(description, all)
    }

    pub fn with_block(mut self, block: NestedBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn to_schema(&self) -> Schema {
        Schema {
            version: self.version,
            block: Some(self.to_proto()),
        }
    }

    fn to_proto(&self) -> schema::Block {
        schema::Block {
            version: self.version,
            attributes: self.attributes.iter().map(Attribute::to_proto).collect(),
            block_types: self
                .blocks
                .iter()
                .map(|nb| {
                    let nesting = match nb.nesting {
                        Nesting::Single => schema::nested_block::NestingMode::Single,
                        Nesting::List => schema::nested_block::NestingMode::List,
                        Nesting::Set => schema::nested_block::NestingMode::Set,
                    };
                    schema::NestedBlock {
                        type_name: nb.type_name.to_string(),
                        block: Some(nb.block.to_proto()),
                        nesting: nesting as i32,
                        min_items: nb.min_items,
                        max_items: nb.max_items,
                    }
                })
                .collect(),
            description: self.description.to_string(),
            description_kind: StringKind::Plain as i32,
            deprecated: false,
        }
    }

    /// Shape a value so it matches this block exactly: every attribute and
    /// nested block present (null or empty when missing), unknown keys dropped,
    /// and collections stored as arrays.
    pub fn conform(&self, value: &Value) -> Value {
        let mut full = serde_json::Map::new();

        for attr in &self.attributes {
            let v = value.get(attr.name).cloned().unwrap_or(Value::Null);
            let v = match coerce_value(v, &attr.ty) {
                // Optional collections left empty are stored as null.
                Value::Array(items) if items.is_empty() && !attr.computed => Value::Null,
                Value::Object(map) if map.is_empty() && !attr.computed => Value::Null,
                v => v,
            };
            full.insert(attr.name.to_string(), v);
        }

        for nb in &self.blocks {
            let user_val = value.get(nb.type_name).cloned().unwrap_or(Value::Null);
            let val = match (nb.nesting, user_val) {
                (Nesting::Single, Value::Object(obj)) => nb.block.conform(&Value::Object(obj)),
                (Nesting::Single, _) => Value::Null,
                (_, Value::Array(items)) => {
                    Value::Array(items.iter().map(|item| nb.block.conform(item)).collect())
                }
                // LIST/SET: single object → wrap in array
                (_, Value::Object(obj)) => Value::Array(vec![nb.block.conform(&Value::Object(obj))]),
                (_, _) => json!([]),
            };
            full.insert(nb.type_name.to_string(), val);
        }

        Value::Object(full)
    }
}

/// Coerce a JSON value to match the expected cty type.
fn coerce_value(value: Value, ty: &AttrType) -> Value {
    if value.is_null() {
        return value;
    }
    match (ty, value) {
        (AttrType::String, Value::Number(n)) => Value::String(n.to_string()),
        (AttrType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (AttrType::Number, Value::String(s)) => match s.parse::<i64>() {
            Ok(n) => json!(n),
            Err(_) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::String(s)),
        },
        (AttrType::Bool, Value::String(s)) => match s.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        (AttrType::List(elem) | AttrType::Set(elem), Value::Array(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| coerce_value(item, elem))
                .collect(),
        ),
        // A scalar where a list or set belongs: wrap it.
        (AttrType::List(_) | AttrType::Set(_), v) if !v.is_object() => Value::Array(vec![v]),
        (AttrType::Map(elem), Value::Object(map)) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, coerce_value(v, elem)))
                .collect(),
        ),
        (_, v) => v,
    }
}

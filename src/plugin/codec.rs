use anyhow::{Context, Result};

use super::tfplugin6::{attribute_path, AttributePath, DynamicValue};

/// cty msgpack extension code for a wholly unknown value.
const UNKNOWN_EXT: i8 = 0;
/// cty msgpack extension code for an unknown value carrying refinements.
const REFINED_UNKNOWN_EXT: i8 = 12;

// ─── Msgpack/cty Helpers ─────────────────────────────────────────────────────

/// The value cty encodes for "known after apply".
pub fn unknown() -> rmpv::Value {
    rmpv::Value::Ext(UNKNOWN_EXT, vec![0])
}

pub fn is_unknown(value: &rmpv::Value) -> bool {
    matches!(value, rmpv::Value::Ext(code, _) if *code == UNKNOWN_EXT || *code == REFINED_UNKNOWN_EXT)
}

pub fn is_null(value: &rmpv::Value) -> bool {
    matches!(value, rmpv::Value::Nil)
}

/// Look up a top-level attribute of a msgpack object.
pub fn get_attr<'a>(object: &'a rmpv::Value, name: &str) -> Option<&'a rmpv::Value> {
    object
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(name))
        .map(|(_, v)| v)
}

/// Replace (or insert) a top-level attribute of a msgpack object.
pub fn set_attr(object: &mut rmpv::Value, name: &str, value: rmpv::Value) {
    if let rmpv::Value::Map(entries) = object {
        if let Some(entry) = entries.iter_mut().find(|(k, _)| k.as_str() == Some(name)) {
            entry.1 = value;
        } else {
            entries.push((rmpv::Value::from(name), value));
        }
    }
}

/// Convert rmpv::Value to serde_json::Value.
/// Unknown values (cty extension types) become null; callers that must keep
/// them work on the raw msgpack value instead.
pub fn rmpv_to_json(val: rmpv::Value) -> serde_json::Value {
    match val {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        rmpv::Value::String(s) => {
            serde_json::Value::String(s.into_str().unwrap_or_default())
        }
        rmpv::Value::Binary(b) => {
            serde_json::Value::String(String::from_utf8_lossy(&b).into_owned())
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                let key = match k {
                    rmpv::Value::String(s) => s.into_str().unwrap_or_default(),
                    other => format!("{}", other),
                };
                map.insert(key, rmpv_to_json(v));
            }
            serde_json::Value::Object(map)
        }
        rmpv::Value::Ext(_, _) => serde_json::Value::Null,
    }
}

/// Convert serde_json::Value to rmpv::Value.
/// Whole numbers stay integers, which is how cty encodes them.
pub fn json_to_rmpv(val: &serde_json::Value) -> rmpv::Value {
    match val {
        serde_json::Value::Null => rmpv::Value::Nil,
        serde_json::Value::Bool(b) => rmpv::Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => rmpv::Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            rmpv::Value::Array(items.iter().map(json_to_rmpv).collect())
        }
        serde_json::Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), json_to_rmpv(v)))
                .collect(),
        ),
    }
}

// ─── DynamicValue ────────────────────────────────────────────────────────────

/// Decode a DynamicValue keeping cty unknowns intact.
pub fn decode_raw(dv: Option<&DynamicValue>) -> Result<rmpv::Value> {
    let Some(dv) = dv else {
        return Ok(rmpv::Value::Nil);
    };
    if !dv.msgpack.is_empty() {
        rmpv::decode::read_value(&mut &dv.msgpack[..]).context("Failed to decode msgpack")
    } else if !dv.json.is_empty() {
        let json: serde_json::Value =
            serde_json::from_slice(&dv.json).context("Failed to decode JSON value")?;
        Ok(json_to_rmpv(&json))
    } else {
        Ok(rmpv::Value::Nil)
    }
}

/// Decode a DynamicValue into JSON. Unknown values read as null.
pub fn decode(dv: Option<&DynamicValue>) -> Result<serde_json::Value> {
    Ok(rmpv_to_json(decode_raw(dv)?))
}

pub fn encode_raw(value: &rmpv::Value) -> Result<DynamicValue> {
    let mut msgpack = Vec::new();
    rmpv::encode::write_value(&mut msgpack, value).context("Failed to encode msgpack")?;
    Ok(DynamicValue {
        msgpack,
        json: vec![],
    })
}

pub fn encode(value: &serde_json::Value) -> Result<DynamicValue> {
    let msgpack = rmp_serde::to_vec_named(value).context("Failed to encode state as msgpack")?;
    Ok(DynamicValue {
        msgpack,
        json: vec![],
    })
}

// ─── Attribute Paths ─────────────────────────────────────────────────────────

pub fn attribute_path(name: &str) -> AttributePath {
    AttributePath {
        steps: vec![attribute_path::Step {
            selector: Some(attribute_path::step::Selector::AttributeName(
                name.to_string(),
            )),
        }],
    }
}

pub fn attribute_path_to_string(path: &AttributePath) -> String {
    path.steps
        .iter()
        .map(|step| {
            use attribute_path::step::Selector;
            match &step.selector {
                Some(Selector::AttributeName(name)) => name.clone(),
                Some(Selector::ElementKeyString(key)) => format!("[{}]", key),
                Some(Selector::ElementKeyInt(idx)) => format!("[{}]", idx),
                None => "?".to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

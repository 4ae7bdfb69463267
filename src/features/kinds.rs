//! Stage fragments installed by the feature kwargs.
//!
//! Each function here is registered under a fixed id (`checks`, `extract`,
//! `cast`, `map`, `convert`, `validate`, `discard`, `enabling`) so that driver
//! authors can anchor their own customizations on them.

use crate::driver::Node;
use crate::error::{DaqError, DaqResult};
use crate::features::{Feature, FeatureKind, FeatureLimits};
use crate::limits::limits_error;
use crate::value::{RegisterValue, Value};

// =============================================================================
// Alias
// =============================================================================

/// Split an alias target into the owning node and the feature name.
///
/// `.output` is the parent's `output`, `..output` the grandparent's and
/// `dac.level` the `level` feature of the `dac` subsystem.
fn alias_target<'a>(feat: &Feature, driver: &Node<'a>) -> DaqResult<(Node<'a>, String)> {
    let FeatureKind::Alias { target, .. } = &feat.kwargs().kind else {
        return Err(DaqError::Configuration(format!(
            "{} is not an alias",
            feat.name()
        )));
    };
    let mut segments: Vec<&str> = target.split('.').collect();
    let name = segments.pop().unwrap_or_default();
    if name.is_empty() {
        return Err(DaqError::Configuration(format!(
            "alias {} has an empty target '{target}'",
            feat.name()
        )));
    }
    let node = driver.resolve_path(&segments)?;
    Ok((node, name.to_string()))
}

pub(super) fn alias_get(feat: &Feature, driver: &Node<'_>) -> DaqResult<Value> {
    let (node, name) = alias_target(feat, driver)?;
    node.get(&name)
}

pub(super) fn alias_set(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let (node, name) = alias_target(feat, driver)?;
    node.set(&name, value)?;
    Ok(Value::None)
}

// =============================================================================
// Checks and extraction
// =============================================================================

pub(super) fn check_get(feat: &Feature, driver: &Node<'_>) -> DaqResult<()> {
    match feat.get_checks() {
        Some(checker) => checker.check(|ident| driver.resolve_identifier(ident, &[])),
        None => Ok(()),
    }
}

pub(super) fn check_set(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    if let Some(checker) = feat.set_checks() {
        checker.check(|ident| driver.resolve_identifier(ident, &[("value", value.clone())]))?;
    }
    Ok(value)
}

pub(super) fn extract(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    match feat.extractor() {
        Some(extractor) => extractor.extract(&value),
        None => Ok(value),
    }
}

// =============================================================================
// post_get casts
// =============================================================================

fn reply_text(value: &Value) -> String {
    value.to_command_text().trim().to_string()
}

pub(super) fn cast_str(_feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    Ok(match value {
        Value::Str(s) => Value::Str(s.trim_end().to_string()),
        other => Value::Str(other.to_command_text()),
    })
}

fn parse_int(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        let text = reply_text(value);
        text.parse::<i64>().ok().or_else(|| {
            text.parse::<f64>()
                .ok()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        })
    })
}

pub(super) fn cast_int(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    parse_int(&value).map(Value::Int).ok_or_else(|| {
        DaqError::Conversion(format!("{}: cannot convert '{value}' to an integer", feat.name()))
    })
}

pub(super) fn cast_float(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let magnitude = match (&value, feat.unit()) {
        (Value::Quantity(q), Some(unit)) => q.magnitude_in(unit)?,
        _ => value
            .as_f64()
            .or_else(|| reply_text(&value).parse::<f64>().ok())
            .ok_or_else(|| {
                DaqError::Conversion(format!("{}: cannot convert '{value}' to a float", feat.name()))
            })?,
    };
    match feat.unit() {
        Some(unit) if driver.unit_return(feat.name()) => Value::Float(magnitude).with_unit(unit),
        _ => Ok(Value::Float(magnitude)),
    }
}

pub(super) fn cast_register(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let bits = match &value {
        Value::Register(r) => r.bits,
        other => {
            let text = reply_text(other);
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("#H")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => parse_int(other).and_then(|i| u64::try_from(i).ok()),
            };
            parsed.ok_or_else(|| {
                DaqError::Conversion(format!("{}: '{other}' is not a register value", feat.name()))
            })?
        }
    };
    Ok(Value::Register(RegisterValue::new(
        feat.register_type_name(),
        bits,
        feat.register_names().to_vec(),
    )))
}

pub(super) fn cast_options(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    match value {
        Value::Map(_) => Ok(value),
        other => Err(DaqError::Conversion(format!(
            "{}: options must be read as a map, got '{other}'",
            feat.name()
        ))),
    }
}

// =============================================================================
// Mappings
// =============================================================================

pub(super) fn reverse_map(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    feat.kwargs()
        .mapping
        .as_ref()
        .and_then(|mapping| mapping.from_instrument(&value))
        .cloned()
        .ok_or_else(|| {
            DaqError::Conversion(format!("{}: unexpected instrument value '{value}'", feat.name()))
        })
}

pub(super) fn forward_map(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let Some(mapping) = &feat.kwargs().mapping else {
        return Ok(value);
    };
    mapping.to_instrument(&value).cloned().ok_or_else(|| {
        let allowed: Vec<String> = mapping.user_values().iter().map(|v| v.to_string()).collect();
        DaqError::InvalidValue {
            name: feat.name().to_string(),
            value: value.to_string(),
            allowed: allowed.join(", "),
        }
    })
}

fn bool_aliases(feat: &Feature) -> &[(bool, Vec<Value>)] {
    match &feat.kwargs().kind {
        FeatureKind::Bool { aliases } => aliases,
        _ => &[],
    }
}

pub(super) fn bool_from_instrument(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    if feat.kwargs().mapping.is_some() {
        return reverse_map(feat, driver, value);
    }
    let text = reply_text(&value);
    for (state, aliases) in bool_aliases(feat) {
        if aliases
            .iter()
            .any(|alias| alias.loose_eq(&value) || alias.to_command_text().eq_ignore_ascii_case(&text))
        {
            return Ok(Value::Bool(*state));
        }
    }
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(Value::Bool(true)),
        "0" | "false" | "off" => Ok(Value::Bool(false)),
        _ => Err(DaqError::Conversion(format!(
            "{}: '{value}' is not a boolean reply",
            feat.name()
        ))),
    }
}

pub(super) fn bool_to_instrument(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let state = value
        .as_bool()
        .or_else(|| match value.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        })
        .ok_or_else(|| DaqError::InvalidValue {
            name: feat.name().to_string(),
            value: value.to_string(),
            allowed: "true, false".to_string(),
        })?;
    if feat.kwargs().mapping.is_some() {
        return forward_map(feat, driver, Value::Bool(state));
    }
    let alias = bool_aliases(feat)
        .iter()
        .find(|(s, aliases)| *s == state && !aliases.is_empty())
        .and_then(|(_, aliases)| aliases.first().cloned());
    Ok(alias.unwrap_or(Value::Int(i64::from(state))))
}

// =============================================================================
// pre_set conversion and validation
// =============================================================================

pub(super) fn convert_unit(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    match (&value, feat.unit()) {
        (Value::Quantity(q), Some(unit)) => Ok(Value::Float(q.magnitude_in(unit)?)),
        _ => Ok(value),
    }
}

pub(super) fn validate_values(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let values = &feat.kwargs().values;
    if values.iter().any(|allowed| allowed.loose_eq(&value)) {
        return Ok(value);
    }
    let allowed: Vec<String> = values.iter().map(Value::to_string).collect();
    Err(DaqError::InvalidValue {
        name: feat.name().to_string(),
        value: value.to_string(),
        allowed: allowed.join(", "),
    })
}

pub(super) fn validate_limits(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    let limits = match feat.limits() {
        Some(FeatureLimits::Static(limits)) => limits.clone(),
        Some(FeatureLimits::Named(id)) => driver.get_limits(id)?,
        None => return Ok(value),
    };
    if limits.validate(&value)? {
        Ok(value)
    } else {
        Err(limits_error(feat.name(), &value, &limits))
    }
}

pub(super) fn register_to_int(feat: &Feature, _driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    match &value {
        Value::Register(r) => register_bits(feat, r.bits),
        Value::Map(flags) => {
            let register = RegisterValue::from_flags(
                feat.register_type_name(),
                feat.register_names().to_vec(),
                flags,
            )?;
            register_bits(feat, register.bits)
        }
        other => other.as_i64().map(Value::Int).ok_or_else(|| {
            DaqError::Conversion(format!("{}: '{other}' is not a register value", feat.name()))
        }),
    }
}

fn register_bits(feat: &Feature, bits: u64) -> DaqResult<Value> {
    i64::try_from(bits).map(Value::Int).map_err(|_| {
        DaqError::Conversion(format!("{}: register value {bits:#x} exceeds i64", feat.name()))
    })
}

// =============================================================================
// post_set
// =============================================================================

pub(super) fn discard(
    feat: &Feature,
    driver: &Node<'_>,
    _value: &Value,
    _i_value: &Value,
    _response: &Value,
) -> DaqResult<()> {
    let Some(discard) = &feat.kwargs().discard else {
        return Ok(());
    };
    if !discard.features.is_empty() {
        let names: Vec<&str> = discard.features.iter().map(String::as_str).collect();
        driver.clear_cache(false, false, Some(names.as_slice()));
    }
    if !discard.limits.is_empty() {
        let ids: Vec<&str> = discard.limits.iter().map(String::as_str).collect();
        driver.discard_limits(&ids);
    }
    Ok(())
}

// =============================================================================
// Enabling
// =============================================================================

/// `pre_get` guard failing when the owning subsystem or channel is disabled.
pub(crate) fn enabling_get(feat: &Feature, driver: &Node<'_>) -> DaqResult<()> {
    driver.ensure_enabled(feat.name())
}

/// `pre_set` counterpart of [`enabling_get`].
pub(crate) fn enabling_set(feat: &Feature, driver: &Node<'_>, value: Value) -> DaqResult<Value> {
    driver.ensure_enabled(feat.name())?;
    Ok(value)
}

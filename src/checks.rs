//! Expression checks, command formatting and response extraction.
//!
//! Check strings are `;` separated boolean expressions evaluated with
//! `evalexpr`. Identifiers are resolved lazily by the caller, so a check such
//! as `driver.output == true; value > 0` only reads the features it names.
//! String literals use double quotes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use evalexpr::{
    build_operator_tree, Context, ContextWithMutableVariables, HashMapContext,
    Node as ExprTree, Operator, Value as ExprValue,
};
use regex::Regex;
use tracing::trace;

use crate::error::{DaqError, DaqResult};
use crate::value::Value;

// =============================================================================
// Checker
// =============================================================================

/// A parsed list of boolean assertions.
#[derive(Clone)]
pub struct Checker {
    source: String,
    assertions: Vec<(String, ExprTree)>,
}

impl Checker {
    /// Parse `;` separated assertions. Syntax errors are configuration errors.
    pub fn parse(checks: &str) -> DaqResult<Self> {
        let assertions = checks
            .split(';')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| parse_tree(a).map(|tree| (a.to_string(), tree)))
            .collect::<DaqResult<Vec<_>>>()?;
        Ok(Self {
            source: checks.to_string(),
            assertions,
        })
    }

    /// Text the checker was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// All variable identifiers used by the assertions.
    pub fn identifiers(&self) -> Vec<String> {
        let mut idents: Vec<String> = self
            .assertions
            .iter()
            .flat_map(|(_, tree)| tree.iter_variable_identifiers().map(str::to_string))
            .collect();
        idents.sort();
        idents.dedup();
        idents
    }

    /// Evaluate every assertion, failing on the first one that is false.
    pub fn check(&self, mut resolve: impl FnMut(&str) -> DaqResult<Value>) -> DaqResult<()> {
        for (assertion, tree) in &self.assertions {
            let (ok, namespace) = evaluate(tree, &mut resolve)?;
            if !ok {
                return Err(DaqError::CheckFailed {
                    assertion: assertion.clone(),
                    namespace,
                });
            }
        }
        Ok(())
    }

    /// Evaluate every assertion and report the first failing one.
    pub fn evaluate(
        &self,
        mut resolve: impl FnMut(&str) -> DaqResult<Value>,
    ) -> DaqResult<(bool, String)> {
        for (assertion, tree) in &self.assertions {
            let (ok, namespace) = evaluate(tree, &mut resolve)?;
            if !ok {
                return Ok((false, format!("{assertion} is false ({namespace})")));
            }
        }
        Ok((true, String::new()))
    }
}

impl fmt::Debug for Checker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checker").field(&self.source).finish()
    }
}

/// Build the operator tree of `text` and reject operators missing operands.
///
/// `evalexpr` accepts trees such as `value >` and only fails when they are
/// evaluated.
fn parse_tree(text: &str) -> DaqResult<ExprTree> {
    let tree = build_operator_tree(text)
        .map_err(|e| DaqError::Configuration(format!("invalid expression '{text}': {e}")))?;
    check_arity(text, &tree)?;
    Ok(tree)
}

fn check_arity(text: &str, node: &ExprTree) -> DaqResult<()> {
    use Operator::*;

    let expected = match node.operator() {
        Add | Sub | Mul | Div | Mod | Exp | Eq | Neq | Gt | Lt | Geq | Leq | And | Or => Some(2),
        Assign | AddAssign | SubAssign | MulAssign | DivAssign | ModAssign | ExpAssign
        | AndAssign | OrAssign => Some(2),
        Neg | Not | FunctionIdentifier { .. } => Some(1),
        _ => None,
    };
    let found = node.children().len();
    if expected.is_some_and(|n| n != found) || (*node.operator() == RootNode && found > 1) {
        return Err(DaqError::Configuration(format!(
            "invalid expression '{text}': '{}' has {found} operand(s)",
            node.operator()
        )));
    }
    node.children().iter().try_for_each(|child| check_arity(text, child))
}

fn evaluate(
    tree: &ExprTree,
    resolve: &mut impl FnMut(&str) -> DaqResult<Value>,
) -> DaqResult<(bool, String)> {
    let (context, namespace) = build_context(tree, resolve)?;
    match tree.eval_boolean_with_context(&context) {
        Ok(ok) => Ok((ok, namespace)),
        Err(e) => Err(DaqError::CheckFailed {
            assertion: e.to_string(),
            namespace,
        }),
    }
}

fn build_context(
    tree: &ExprTree,
    resolve: &mut impl FnMut(&str) -> DaqResult<Value>,
) -> DaqResult<(HashMapContext, String)> {
    let mut context = HashMapContext::new();
    let mut namespace = Vec::new();
    for ident in tree.iter_variable_identifiers() {
        if context.get_value(ident).is_some() {
            continue;
        }
        let value = resolve(ident)?;
        namespace.push(format!("{ident}={value}"));
        context
            .set_value(ident.to_string(), to_expr_value(&value)?)
            .map_err(|e| DaqError::Configuration(e.to_string()))?;
    }
    Ok((context, namespace.join(", ")))
}

/// A single expression producing a value, e.g.
/// `if(driver.mode == "FAST", "FREQ:FAST?", "FREQ?")`.
#[derive(Clone)]
pub struct Expression {
    text: String,
    tree: ExprTree,
}

impl Expression {
    /// Parse `text`; syntax errors are configuration errors.
    pub fn parse(text: &str) -> DaqResult<Self> {
        let tree = parse_tree(text)?;
        Ok(Self {
            text: text.to_string(),
            tree,
        })
    }

    /// Text the expression was parsed from.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate, resolving identifiers through `resolve`.
    pub fn eval(&self, mut resolve: impl FnMut(&str) -> DaqResult<Value>) -> DaqResult<Value> {
        let (context, namespace) = build_context(&self.tree, &mut resolve)?;
        let value = self
            .tree
            .eval_with_context(&context)
            .map_err(|e| DaqError::CheckFailed {
                assertion: format!("{}: {e}", self.text),
                namespace,
            })?;
        Ok(from_expr_value(value))
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.text).finish()
    }
}

fn from_expr_value(value: ExprValue) -> Value {
    match value {
        ExprValue::Empty => Value::None,
        ExprValue::Boolean(b) => Value::Bool(b),
        ExprValue::Int(i) => Value::Int(i),
        ExprValue::Float(f) => Value::Float(f),
        ExprValue::String(s) => Value::Str(s),
        ExprValue::Tuple(items) => Value::List(items.into_iter().map(from_expr_value).collect()),
    }
}

fn to_expr_value(value: &Value) -> DaqResult<ExprValue> {
    Ok(match value {
        Value::None => ExprValue::Empty,
        Value::Bool(b) => ExprValue::Boolean(*b),
        Value::Int(i) => ExprValue::Int(*i),
        Value::Float(f) => ExprValue::Float(*f),
        Value::Str(s) => ExprValue::String(s.clone()),
        Value::Quantity(q) => ExprValue::Float(q.magnitude),
        Value::Register(r) => ExprValue::Int(i64::try_from(r.bits).map_err(|_| {
            DaqError::Conversion(format!("register value {:#x} exceeds i64", r.bits))
        })?),
        Value::List(items) => ExprValue::Tuple(
            items
                .iter()
                .map(to_expr_value)
                .collect::<DaqResult<Vec<_>>>()?,
        ),
        Value::Map(_) => {
            return Err(DaqError::Conversion(
                "maps cannot be used in check expressions".to_string(),
            ))
        }
    })
}

/// Evaluate an options expression such as `opts.has_filter == true`.
///
/// Identifiers are `<options feature>.<option name>`.
pub fn check_options(
    checker: &Checker,
    options: &BTreeMap<String, Value>,
) -> DaqResult<(bool, String)> {
    checker.evaluate(|ident| {
        let (feature, key) = ident.split_once('.').ok_or_else(|| {
            DaqError::Configuration(format!("option reference '{ident}' lacks a field"))
        })?;
        options
            .get(feature)
            .and_then(Value::as_map)
            .and_then(|map| map.get(key))
            .cloned()
            .ok_or_else(|| DaqError::Configuration(format!("unknown option '{ident}'")))
    })
}

// =============================================================================
// Command formatting
// =============================================================================

/// Render a command template.
///
/// Positional `{}` placeholders are numbered in order of appearance and bound
/// to `positional`; named placeholders such as `{id}` come from `named`.
pub fn format_command(
    template: &str,
    positional: &[Value],
    named: &BTreeMap<String, Value>,
) -> DaqResult<String> {
    let mut numbered = String::with_capacity(template.len() + 4);
    let mut next = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            match chars.peek() {
                Some('{') => {
                    chars.next();
                    numbered.push_str("{{");
                    continue;
                }
                Some('}') | Some(':') => {
                    numbered.push('{');
                    numbered.push_str(&next.to_string());
                    next += 1;
                    continue;
                }
                _ => {}
            }
        }
        numbered.push(c);
    }

    let mut vars: HashMap<String, String> = named
        .iter()
        .map(|(k, v)| (k.clone(), v.to_command_text()))
        .collect();
    for (i, value) in positional.iter().enumerate() {
        vars.insert(i.to_string(), value.to_command_text());
    }
    let command = strfmt::strfmt(&numbered, &vars)
        .map_err(|e| DaqError::Configuration(format!("cannot format '{template}': {e}")))?;
    trace!(template, %command, "formatted command");
    Ok(command)
}

// =============================================================================
// Extraction
// =============================================================================

/// Pulls values out of an instrument reply following a `{}` pattern.
#[derive(Debug, Clone)]
pub struct Extractor {
    pattern: String,
    regex: Regex,
    groups: usize,
}

impl Extractor {
    /// Compile a pattern such as `VOLT {}` or `{},{}`.
    pub fn new(pattern: &str) -> DaqResult<Self> {
        let mut expr = String::from("^");
        let mut literal = String::new();
        let mut groups = 0;
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            if c == '{' {
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                }
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str("(.*?)");
                groups += 1;
            } else {
                literal.push(c);
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');
        if groups == 0 {
            return Err(DaqError::Configuration(format!(
                "extract pattern '{pattern}' has no placeholder"
            )));
        }
        let regex = Regex::new(&expr)
            .map_err(|e| DaqError::Configuration(format!("bad extract pattern '{pattern}': {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            groups,
        })
    }

    /// Pattern the extractor was built from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Extract the placeholder values: one string, or a list for several.
    pub fn extract(&self, reply: &Value) -> DaqResult<Value> {
        let text = match reply {
            Value::Str(s) => s.trim_end().to_string(),
            other => other.to_command_text(),
        };
        let captures = self.regex.captures(&text).ok_or_else(|| {
            DaqError::Conversion(format!(
                "reply '{text}' does not match pattern '{}'",
                self.pattern
            ))
        })?;
        let mut values: Vec<Value> = captures
            .iter()
            .skip(1)
            .map(|m| Value::Str(m.map(|m| m.as_str().to_string()).unwrap_or_default()))
            .collect();
        if self.groups == 1 {
            Ok(values.pop().unwrap_or_default())
        } else {
            Ok(Value::List(values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_resolves_identifiers() {
        let checker = Checker::parse("value > 0; driver.mode == \"ON\"").unwrap();
        assert_eq!(checker.identifiers(), vec!["driver.mode", "value"]);

        let ok = checker.check(|ident| match ident {
            "value" => Ok(Value::Int(3)),
            "driver.mode" => Ok(Value::Str("ON".into())),
            _ => Err(DaqError::Configuration(ident.into())),
        });
        assert!(ok.is_ok());

        let err = checker
            .check(|ident| match ident {
                "value" => Ok(Value::Int(-1)),
                _ => Ok(Value::Str("ON".into())),
            })
            .unwrap_err();
        match err {
            DaqError::CheckFailed { assertion, namespace } => {
                assert_eq!(assertion, "value > 0");
                assert_eq!(namespace, "value=-1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_expression_selects_command() {
        let expr = Expression::parse("if(driver.mode == \"FAST\", \"FREQ:FAST?\", \"FREQ?\")").unwrap();
        let cmd = expr.eval(|_| Ok(Value::Str("FAST".into()))).unwrap();
        assert_eq!(cmd, Value::Str("FREQ:FAST?".into()));
        let cmd = expr.eval(|_| Ok(Value::Str("SLOW".into()))).unwrap();
        assert_eq!(cmd, Value::Str("FREQ?".into()));
    }

    #[test]
    fn test_checker_rejects_bad_syntax() {
        for text in ["value >", "driver.ready >", "value > 0; == 2", "!", "value > 0 &&"] {
            let err = Checker::parse(text).unwrap_err();
            assert!(err.is_configuration(), "{text} gave {err:?}");
        }
        assert!(Expression::parse("if(driver.mode == ,").is_err());
        assert!(Expression::parse("1 +").is_err());

        assert!(Checker::parse("-value < 2; !(driver.busy == true)").is_ok());
        assert!(Expression::parse("if(driver.fast, \"A?\", \"B?\")").is_ok());
    }

    #[test]
    fn test_options_check() {
        let checker = Checker::parse("opts.filter == true").unwrap();
        let mut opts = BTreeMap::new();
        opts.insert("filter".to_string(), Value::Bool(false));
        let mut options = BTreeMap::new();
        options.insert("opts".to_string(), Value::Map(opts));
        let (ok, msg) = check_options(&checker, &options).unwrap();
        assert!(!ok);
        assert!(msg.contains("opts.filter"));
    }

    #[test]
    fn test_format_command() {
        let mut named = BTreeMap::new();
        named.insert("id".to_string(), Value::Int(2));
        let cmd = format_command("SOUR{id}:VOLT {}", &[Value::Float(1.5)], &named).unwrap();
        assert_eq!(cmd, "SOUR2:VOLT 1.5");
        let cmd = format_command("FREQ {}", &[Value::Str("MAX".into())], &BTreeMap::new()).unwrap();
        assert_eq!(cmd, "FREQ MAX");
    }

    #[test]
    fn test_extractor() {
        let extractor = Extractor::new("VOLT {}").unwrap();
        assert_eq!(
            extractor.extract(&Value::Str("VOLT 1.25\n".into())).unwrap(),
            Value::Str("1.25".into())
        );
        let pair = Extractor::new("{},{}").unwrap();
        assert_eq!(
            pair.extract(&Value::Str("1,ON".into())).unwrap(),
            Value::List(vec![Value::Str("1".into()), Value::Str("ON".into())])
        );
        assert!(extractor.extract(&Value::Str("CURR 1".into())).is_err());
        assert!(Extractor::new("no placeholder").is_err());
    }
}

//! Tree-walking evaluator

use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{ConditionError, Result};
use crate::functions::FunctionRegistry;
use crate::parser::{BinaryOp, Expr};

/// Name under which the whole binding map is reachable (`vars.x`, `vars["x"]`)
pub const VARS: &str = "vars";

pub(crate) struct Scope<'a> {
    pub bindings: &'a HashMap<String, Value>,
    pub functions: &'a FunctionRegistry,
}

impl<'a> Scope<'a> {
    pub fn eval(&self, expr: &Expr) -> Result<Cow<'a, Value>> {
        match expr {
            Expr::Literal(v) => Ok(Cow::Owned(v.clone())),
            Expr::Ident(name) => self.ident(name),
            Expr::Member(base, field) => {
                if self.is_vars(base) {
                    return self.binding(field);
                }
                let base = self.eval(base)?;
                select(base, field)
            }
            Expr::Index(base, index) => {
                let index = self.eval(index)?;
                if self.is_vars(base) {
                    return self.binding(key_of(&index)?);
                }
                let base = self.eval(base)?;
                match &*index {
                    Value::String(key) => select(base, key),
                    Value::Number(n) => {
                        let i = n
                            .as_u64()
                            .ok_or_else(|| ConditionError::type_error("list index must be a non-negative integer"))?;
                        select_index(base, i as usize)
                    }
                    other => Err(ConditionError::type_error(format!("invalid index {}", other))),
                }
            }
            Expr::Has(target) => Ok(Cow::Owned(Value::Bool(self.has(target)?))),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item).map(Cow::into_owned))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Cow::Owned(Value::Array(values)))
            }
            Expr::Call(name, args) => {
                if !self.functions.contains(name) {
                    return Err(ConditionError::UnknownFunction(name.clone()));
                }
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg).map(Cow::into_owned))
                    .collect::<Result<Vec<_>>>()?;
                self.functions.call(name, &values).map(Cow::Owned)
            }
            Expr::Not(inner) => {
                let value = self.eval_bool(inner)?;
                Ok(Cow::Owned(Value::Bool(!value)))
            }
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                match &*value {
                    Value::Number(n) if n.is_i64() => Ok(Cow::Owned(Value::from(-n.as_i64().unwrap_or(0)))),
                    Value::Number(n) => Ok(Cow::Owned(
                        serde_json::Number::from_f64(-n.as_f64().unwrap_or(0.0))
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                    )),
                    other => Err(ConditionError::type_error(format!("cannot negate {}", other))),
                }
            }
            Expr::Binary(op, left, right) => self.binary(*op, left, right).map(Cow::Owned),
        }
    }

    pub fn eval_bool(&self, expr: &Expr) -> Result<bool> {
        match &*self.eval(expr)? {
            Value::Bool(b) => Ok(*b),
            other => Err(ConditionError::type_error(format!(
                "expected a boolean, got {}",
                other
            ))),
        }
    }

    fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value> {
        match op {
            BinaryOp::And => {
                let result = self.eval_bool(left)? && self.eval_bool(right)?;
                Ok(Value::Bool(result))
            }
            BinaryOp::Or => {
                let result = self.eval_bool(left)? || self.eval_bool(right)?;
                Ok(Value::Bool(result))
            }
            _ => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let result = match op {
                    BinaryOp::Eq => values_equal(&l, &r),
                    BinaryOp::Ne => !values_equal(&l, &r),
                    BinaryOp::Lt => compare(&l, &r)? == Ordering::Less,
                    BinaryOp::Le => compare(&l, &r)? != Ordering::Greater,
                    BinaryOp::Gt => compare(&l, &r)? == Ordering::Greater,
                    BinaryOp::Ge => compare(&l, &r)? != Ordering::Less,
                    BinaryOp::In => contains(&r, &l)?,
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                };
                Ok(Value::Bool(result))
            }
        }
    }

    fn has(&self, target: &Expr) -> Result<bool> {
        match target {
            Expr::Ident(name) => Ok(name == VARS || self.bindings.contains_key(name)),
            Expr::Member(base, field) => {
                if self.is_vars(base) {
                    return Ok(self.bindings.contains_key(field));
                }
                let base = self.eval(base)?;
                has_key(&base, field)
            }
            Expr::Index(base, index) => {
                let index = self.eval(index)?;
                let key = key_of(&index)?;
                if self.is_vars(base) {
                    return Ok(self.bindings.contains_key(key));
                }
                let base = self.eval(base)?;
                has_key(&base, key)
            }
            _ => Err(ConditionError::type_error("has() requires a field selection")),
        }
    }

    fn is_vars(&self, expr: &Expr) -> bool {
        matches!(expr, Expr::Ident(name) if name == VARS && !self.bindings.contains_key(VARS))
    }

    fn binding(&self, key: &str) -> Result<Cow<'a, Value>> {
        self.bindings
            .get(key)
            .map(Cow::Borrowed)
            .ok_or_else(|| ConditionError::NoSuchKey(key.to_string()))
    }

    fn ident(&self, name: &str) -> Result<Cow<'a, Value>> {
        if let Some(value) = self.bindings.get(name) {
            return Ok(Cow::Borrowed(value));
        }
        if name == VARS {
            let map: Map<String, Value> = self
                .bindings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Ok(Cow::Owned(Value::Object(map)));
        }
        Err(ConditionError::UnknownVariable(name.to_string()))
    }
}

fn key_of(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| ConditionError::type_error(format!("map key must be a string, got {}", value)))
}

fn has_key(base: &Value, key: &str) -> Result<bool> {
    match base {
        Value::Object(map) => Ok(map.contains_key(key)),
        other => Err(ConditionError::type_error(format!(
            "has() on non-map value {}",
            other
        ))),
    }
}

fn select<'a>(base: Cow<'a, Value>, key: &str) -> Result<Cow<'a, Value>> {
    let missing = || ConditionError::NoSuchKey(key.to_string());
    match base {
        Cow::Borrowed(Value::Object(map)) => map.get(key).map(Cow::Borrowed).ok_or_else(missing),
        Cow::Owned(Value::Object(mut map)) => map.remove(key).map(Cow::Owned).ok_or_else(missing),
        other => Err(ConditionError::type_error(format!(
            "cannot select '{}' from {}",
            key, other
        ))),
    }
}

fn select_index<'a>(base: Cow<'a, Value>, index: usize) -> Result<Cow<'a, Value>> {
    let out_of_range = || ConditionError::type_error(format!("index {} out of range", index));
    match base {
        Cow::Borrowed(Value::Array(items)) => items.get(index).map(Cow::Borrowed).ok_or_else(out_of_range),
        Cow::Owned(Value::Array(mut items)) => {
            if index < items.len() {
                Ok(Cow::Owned(items.swap_remove(index)))
            } else {
                Err(out_of_range())
            }
        }
        other => Err(ConditionError::type_error(format!("cannot index {}", other))),
    }
}

/// Equality with numeric normalisation; values of different types are unequal
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map_or(false, |other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| ConditionError::type_error("numbers are not comparable"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ConditionError::type_error(format!(
            "cannot compare {} with {}",
            a, b
        ))),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|v| values_equal(v, item))),
        Value::Object(map) => Ok(item.as_str().map_or(false, |k| map.contains_key(k))),
        other => Err(ConditionError::type_error(format!(
            "'in' requires a list or map, got {}",
            other
        ))),
    }
}

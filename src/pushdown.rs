// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::ast::BoolOp;
use crate::errors::UnsupportedResidual;
use crate::partial::{ResidualExpr, ResidualQuery, ResidualTerm};
use crate::value::Value;

use core::fmt;
use std::collections::BTreeMap;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
}

impl CompoundOp {
    fn as_str(self) -> &'static str {
        match self {
            CompoundOp::And => "and",
            CompoundOp::Or => "or",
            CompoundOp::Not => "not",
        }
    }

    fn from_str(s: &str) -> Option<CompoundOp> {
        Some(match s {
            "and" => CompoundOp::And,
            "or" => CompoundOp::Or,
            "not" => CompoundOp::Not,
            _ => return None,
        })
    }
}

impl FieldOp {
    fn as_str(self) -> &'static str {
        match self {
            FieldOp::Eq => "eq",
            FieldOp::Ne => "ne",
            FieldOp::Gt => "gt",
            FieldOp::Lt => "lt",
            FieldOp::Ge => "ge",
            FieldOp::Le => "le",
            FieldOp::In => "in",
        }
    }

    fn from_str(s: &str) -> Option<FieldOp> {
        Some(match s {
            "eq" => FieldOp::Eq,
            "ne" => FieldOp::Ne,
            "gt" => FieldOp::Gt,
            "lt" => FieldOp::Lt,
            "ge" => FieldOp::Ge,
            "le" => FieldOp::Le,
            "in" => FieldOp::In,
            _ => return None,
        })
    }
}

/// A node of the query-pushdown predicate tree. Serializes to the
/// `{type, operator, field?, value?}` wire shape and round-trips
/// losslessly through JSON, the one externally-serialized format this
/// crate defines precisely.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateNode {
    Compound {
        operator: CompoundOp,
        children: Vec<PredicateNode>,
    },
    Field {
        operator: FieldOp,
        field: String,
        value: Value,
    },
    /// The referenced document exists.
    Exists { field: String },
}

impl Serialize for PredicateNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        match self {
            PredicateNode::Compound { operator, children } => {
                map.serialize_entry("type", "compound")?;
                map.serialize_entry("operator", operator.as_str())?;
                map.serialize_entry("value", children)?;
            }
            PredicateNode::Field {
                operator,
                field,
                value,
            } => {
                map.serialize_entry("type", "field")?;
                map.serialize_entry("operator", operator.as_str())?;
                map.serialize_entry("field", field)?;
                map.serialize_entry("value", value)?;
            }
            PredicateNode::Exists { field } => {
                map.serialize_entry("type", "document")?;
                map.serialize_entry("operator", "exists")?;
                map.serialize_entry("field", field)?;
            }
        }
        map.end()
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = PredicateNode;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a predicate tree node")
    }

    fn visit_map<V>(self, mut map: V) -> Result<PredicateNode, V::Error>
    where
        V: MapAccess<'de>,
    {
        let mut node_type: Option<String> = None;
        let mut operator: Option<String> = None;
        let mut field: Option<String> = None;
        let mut value: Option<serde_json::Value> = None;

        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "type" => node_type = Some(map.next_value()?),
                "operator" => operator = Some(map.next_value()?),
                "field" => field = Some(map.next_value()?),
                "value" => value = Some(map.next_value()?),
                _ => {
                    let _: serde_json::Value = map.next_value()?;
                }
            }
        }

        let node_type = node_type.ok_or_else(|| de::Error::missing_field("type"))?;
        let operator = operator.ok_or_else(|| de::Error::missing_field("operator"))?;

        match node_type.as_str() {
            "compound" => {
                let op = CompoundOp::from_str(&operator)
                    .ok_or_else(|| de::Error::custom(format!("bad compound op `{operator}`")))?;
                let raw = value.ok_or_else(|| de::Error::missing_field("value"))?;
                let children: Vec<PredicateNode> =
                    serde_json::from_value(raw).map_err(de::Error::custom)?;
                Ok(PredicateNode::Compound { operator: op, children })
            }
            "field" => {
                let op = FieldOp::from_str(&operator)
                    .ok_or_else(|| de::Error::custom(format!("bad field op `{operator}`")))?;
                let field = field.ok_or_else(|| de::Error::missing_field("field"))?;
                let raw = value.ok_or_else(|| de::Error::missing_field("value"))?;
                let value: Value = serde_json::from_value(raw).map_err(de::Error::custom)?;
                Ok(PredicateNode::Field {
                    operator: op,
                    field,
                    value,
                })
            }
            "document" if operator == "exists" => {
                let field = field.ok_or_else(|| de::Error::missing_field("field"))?;
                Ok(PredicateNode::Exists { field })
            }
            _ => Err(de::Error::custom(format!("bad node type `{node_type}`"))),
        }
    }
}

impl<'de> Deserialize<'de> for PredicateNode {
    fn deserialize<D>(deserializer: D) -> Result<PredicateNode, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(NodeVisitor)
    }
}

/// Lower a residual disjunction into the predicate tree. A pure tree
/// transform: residuals with no field-predicate equivalent (unresolved
/// calls, reference-to-reference comparisons) are rejected, never
/// silently dropped.
pub fn to_predicate_tree(residuals: &[ResidualQuery]) -> Result<PredicateNode, UnsupportedResidual> {
    let mut disjuncts = vec![];
    for q in residuals {
        disjuncts.push(lower_conjunction(q)?);
    }
    Ok(match disjuncts.len() {
        1 => disjuncts.pop().expect("len checked"),
        _ => PredicateNode::Compound {
            operator: CompoundOp::Or,
            children: disjuncts,
        },
    })
}

fn lower_conjunction(query: &ResidualQuery) -> Result<PredicateNode, UnsupportedResidual> {
    let mut children = vec![];
    for e in &query.exprs {
        children.push(lower_constraint(e)?);
    }
    Ok(match children.len() {
        1 => children.pop().expect("len checked"),
        _ => PredicateNode::Compound {
            operator: CompoundOp::And,
            children,
        },
    })
}

fn lower_constraint(expr: &ResidualExpr) -> Result<PredicateNode, UnsupportedResidual> {
    match expr {
        ResidualExpr::Compare { op, lhs, rhs } => match (lhs, rhs) {
            (ResidualTerm::Ref(path), ResidualTerm::Value(v)) => Ok(PredicateNode::Field {
                operator: field_op(*op),
                field: ResidualTerm::dotted(path),
                value: v.clone(),
            }),
            (ResidualTerm::Value(v), ResidualTerm::Ref(path)) => Ok(PredicateNode::Field {
                operator: field_op(flip(*op)),
                field: ResidualTerm::dotted(path),
                value: v.clone(),
            }),
            _ => Err(unsupported(expr)),
        },
        ResidualExpr::In { value, collection } => match (value, collection) {
            (ResidualTerm::Ref(path), ResidualTerm::Value(col)) => {
                let items: Vec<Value> = match col {
                    Value::Set(s) => s.iter().cloned().collect(),
                    Value::Array(a) => a.as_ref().clone(),
                    other => vec![other.clone()],
                };
                Ok(PredicateNode::Field {
                    operator: FieldOp::In,
                    field: ResidualTerm::dotted(path),
                    value: Value::from(items),
                })
            }
            _ => Err(unsupported(expr)),
        },
        ResidualExpr::Defined { path } => Ok(PredicateNode::Exists {
            field: ResidualTerm::dotted(path),
        }),
        ResidualExpr::Not(inner) => Ok(PredicateNode::Compound {
            operator: CompoundOp::Not,
            children: vec![lower_constraint(inner)?],
        }),
    }
}

fn field_op(op: BoolOp) -> FieldOp {
    match op {
        BoolOp::Eq => FieldOp::Eq,
        BoolOp::Ne => FieldOp::Ne,
        BoolOp::Gt => FieldOp::Gt,
        BoolOp::Lt => FieldOp::Lt,
        BoolOp::Ge => FieldOp::Ge,
        BoolOp::Le => FieldOp::Le,
    }
}

// Mirror the comparison when the reference is on the right.
fn flip(op: BoolOp) -> BoolOp {
    match op {
        BoolOp::Eq => BoolOp::Eq,
        BoolOp::Ne => BoolOp::Ne,
        BoolOp::Gt => BoolOp::Lt,
        BoolOp::Lt => BoolOp::Gt,
        BoolOp::Ge => BoolOp::Le,
        BoolOp::Le => BoolOp::Ge,
    }
}

fn unsupported(expr: &ResidualExpr) -> UnsupportedResidual {
    UnsupportedResidual {
        expr: format!("{expr:?}"),
    }
}

/// Convenience: serialize/deserialize helpers for the wire format.
impl PredicateNode {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<PredicateNode> {
        Ok(serde_json::from_str(json)?)
    }

    /// Structural field map, handy in tests and debugging.
    pub fn fields(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        fn walk(node: &PredicateNode, out: &mut BTreeMap<String, usize>) {
            match node {
                PredicateNode::Compound { children, .. } => {
                    for c in children {
                        walk(c, out);
                    }
                }
                PredicateNode::Field { field, .. } | PredicateNode::Exists { field } => {
                    *out.entry(field.clone()).or_default() += 1;
                }
            }
        }
        walk(self, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn r(path: &str) -> ResidualTerm {
        ResidualTerm::Ref(path.split('.').map(Rc::from).collect())
    }

    #[test]
    fn json_round_trip() -> anyhow::Result<()> {
        let tree = PredicateNode::Compound {
            operator: CompoundOp::Or,
            children: vec![
                PredicateNode::Field {
                    operator: FieldOp::Eq,
                    field: "input.tenant".to_string(),
                    value: Value::from("acme"),
                },
                PredicateNode::Compound {
                    operator: CompoundOp::Not,
                    children: vec![PredicateNode::Exists {
                        field: "input.banned".to_string(),
                    }],
                },
            ],
        };
        let json = tree.to_json()?;
        assert_eq!(PredicateNode::from_json(&json)?, tree);
        Ok(())
    }

    #[test]
    fn lowers_comparison_to_field_node() -> anyhow::Result<()> {
        let residual = ResidualQuery {
            exprs: vec![ResidualExpr::Compare {
                op: BoolOp::Eq,
                lhs: r("input.tenant"),
                rhs: ResidualTerm::Value(Value::from("acme")),
            }],
        };
        let tree = to_predicate_tree(&[residual]).expect("lowerable");
        assert_eq!(
            tree,
            PredicateNode::Field {
                operator: FieldOp::Eq,
                field: "input.tenant".to_string(),
                value: Value::from("acme"),
            }
        );
        Ok(())
    }

    #[test]
    fn flips_mirrored_comparisons() {
        let residual = ResidualQuery {
            exprs: vec![ResidualExpr::Compare {
                op: BoolOp::Lt,
                lhs: ResidualTerm::Value(Value::from(21i64)),
                rhs: r("input.age"),
            }],
        };
        let tree = to_predicate_tree(&[residual]).expect("lowerable");
        assert_eq!(
            tree,
            PredicateNode::Field {
                operator: FieldOp::Gt,
                field: "input.age".to_string(),
                value: Value::from(21i64),
            }
        );
    }

    #[test]
    fn rejects_unresolved_calls() {
        let residual = ResidualQuery {
            exprs: vec![ResidualExpr::Compare {
                op: BoolOp::Eq,
                lhs: ResidualTerm::Call {
                    name: "lower".to_string(),
                    args: vec![r("input.tenant")],
                },
                rhs: ResidualTerm::Value(Value::from("acme")),
            }],
        };
        assert!(to_predicate_tree(&[residual]).is_err());
    }
}

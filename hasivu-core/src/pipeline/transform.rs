use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{CoreError, Result};

use super::model::Record;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    Int,
    Float,
    String,
    Bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Exists,
    Missing,
}

/// One record-level transformation. Steps run in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TransformStep {
    Rename {
        from: String,
        to: String,
    },
    Drop {
        fields: Vec<String>,
    },
    SetDefault {
        field: String,
        value: Value,
    },
    Cast {
        field: String,
        to: CastType,
    },
    /// Keeps records matching the predicate.
    Filter {
        field: String,
        op: FilterOp,
        #[serde(default)]
        value: Value,
    },
    Require {
        fields: Vec<String>,
    },
    /// Writes the processing timestamp (RFC 3339).
    Stamp {
        field: String,
    },
}

impl TransformStep {
    fn field_names(&self) -> Vec<&str> {
        match self {
            TransformStep::Rename { from, to } => vec![from, to],
            TransformStep::Drop { fields } | TransformStep::Require { fields } => {
                fields.iter().map(String::as_str).collect()
            }
            TransformStep::SetDefault { field, .. }
            | TransformStep::Cast { field, .. }
            | TransformStep::Filter { field, .. }
            | TransformStep::Stamp { field } => vec![field],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rejection {
    /// Position of the record within the batch.
    pub index: usize,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformOutput {
    pub records: Vec<Record>,
    pub filtered: usize,
    pub rejected: Vec<Rejection>,
}

impl TransformOutput {
    /// Rejected share of the records that got past the filters.
    pub fn reject_ratio(&self) -> f64 {
        let transformed = self.records.len() + self.rejected.len();
        if transformed == 0 {
            0.0
        } else {
            self.rejected.len() as f64 / transformed as f64
        }
    }
}

enum Outcome {
    Keep(Record),
    Filtered,
    Rejected(String),
}

#[derive(Clone, Debug, Default)]
pub struct Transformer {
    steps: Vec<TransformStep>,
}

impl Transformer {
    pub fn new(steps: Vec<TransformStep>) -> Self {
        Self { steps }
    }

    pub fn validate(steps: &[TransformStep]) -> Result<()> {
        for (index, step) in steps.iter().enumerate() {
            let names = step.field_names();
            if names.is_empty() || names.iter().any(|name| name.trim().is_empty()) {
                return Err(CoreError::InvalidInput(format!(
                    "transform step {index} references an empty field name"
                )));
            }
            if let TransformStep::Filter { op, value, .. } = step
                && matches!(op, FilterOp::Gt | FilterOp::Lt)
                && !(value.is_number() || value.is_string())
            {
                return Err(CoreError::InvalidInput(format!(
                    "transform step {index}: ordered filters need a number or string operand"
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&self, records: Vec<Record>, now: DateTime<Utc>) -> TransformOutput {
        let stamp = Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true));
        let mut output = TransformOutput {
            records: Vec::with_capacity(records.len()),
            ..TransformOutput::default()
        };
        for (index, record) in records.into_iter().enumerate() {
            match self.apply_one(record, &stamp) {
                Outcome::Keep(record) => output.records.push(record),
                Outcome::Filtered => output.filtered += 1,
                Outcome::Rejected(reason) => output.rejected.push(Rejection { index, reason }),
            }
        }
        output
    }

    fn apply_one(&self, mut record: Record, stamp: &Value) -> Outcome {
        for step in &self.steps {
            match step {
                TransformStep::Rename { from, to } => {
                    if let Some(value) = record.remove(from) {
                        record.insert(to.clone(), value);
                    }
                }
                TransformStep::Drop { fields } => {
                    for field in fields {
                        record.remove(field);
                    }
                }
                TransformStep::SetDefault { field, value } => {
                    let slot = record.entry(field.clone()).or_insert(Value::Null);
                    if slot.is_null() {
                        *slot = value.clone();
                    }
                }
                TransformStep::Cast { field, to } => {
                    let Some(current) = record.get(field) else {
                        continue;
                    };
                    if current.is_null() {
                        continue;
                    }
                    match cast(current, *to) {
                        Some(cast) => {
                            record.insert(field.clone(), cast);
                        }
                        None => {
                            return Outcome::Rejected(format!(
                                "cannot cast field '{field}' to {to:?}"
                            ));
                        }
                    }
                }
                TransformStep::Filter { field, op, value } => {
                    if !filter_matches(record.get(field), *op, value) {
                        return Outcome::Filtered;
                    }
                }
                TransformStep::Require { fields } => {
                    if let Some(missing) = fields
                        .iter()
                        .find(|field| record.get(*field).is_none_or(Value::is_null))
                    {
                        return Outcome::Rejected(format!("missing required field '{missing}'"));
                    }
                }
                TransformStep::Stamp { field } => {
                    record.insert(field.clone(), stamp.clone());
                }
            }
        }
        Outcome::Keep(record)
    }
}

fn cast(value: &Value, to: CastType) -> Option<Value> {
    match to {
        CastType::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        trimmed
                            .parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite() && f.fract() == 0.0)
                            .map(|f| f as i64)
                    })
                    .map(Value::from)
            }
            Value::Bool(b) => Some(Value::from(i64::from(*b))),
            _ => None,
        },
        CastType::Float => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }?;
            Number::from_f64(parsed).map(Value::Number)
        }
        CastType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        CastType::Bool => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "n" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    let as_number = |value: &Value| match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l.partial_cmp(&r);
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn filter_matches(field: Option<&Value>, op: FilterOp, operand: &Value) -> bool {
    let present = field.filter(|value| !value.is_null());
    match op {
        FilterOp::Exists => present.is_some(),
        FilterOp::Missing => present.is_none(),
        FilterOp::Eq => present.is_some_and(|value| {
            value == operand || compare(value, operand) == Some(Ordering::Equal)
        }),
        FilterOp::Ne => present.is_none_or(|value| {
            value != operand && compare(value, operand) != Some(Ordering::Equal)
        }),
        FilterOp::Gt => present.is_some_and(|value| compare(value, operand) == Some(Ordering::Greater)),
        FilterOp::Lt => present.is_some_and(|value| compare(value, operand) == Some(Ordering::Less)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn steps_apply_in_order() {
        let transformer = Transformer::new(vec![
            TransformStep::Rename {
                from: "qty".into(),
                to: "quantity".into(),
            },
            TransformStep::Cast {
                field: "quantity".into(),
                to: CastType::Int,
            },
            TransformStep::SetDefault {
                field: "status".into(),
                value: json!("pending"),
            },
            TransformStep::Drop {
                fields: vec!["internal".into()],
            },
            TransformStep::Stamp {
                field: "processed_at".into(),
            },
        ]);

        let now = Utc::now();
        let output = transformer.apply(
            vec![record(json!({ "qty": "12", "internal": true, "status": null }))],
            now,
        );

        assert_eq!(output.records.len(), 1);
        let row = &output.records[0];
        assert_eq!(row["quantity"], json!(12));
        assert_eq!(row["status"], json!("pending"));
        assert!(!row.contains_key("internal"));
        assert!(!row.contains_key("qty"));
        assert!(row["processed_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn filter_drops_and_require_rejects() {
        let transformer = Transformer::new(vec![
            TransformStep::Filter {
                field: "calories".into(),
                op: FilterOp::Lt,
                value: json!(800),
            },
            TransformStep::Require {
                fields: vec!["meal_id".into()],
            },
        ]);

        let output = transformer.apply(
            vec![
                record(json!({ "meal_id": "a", "calories": 450 })),
                record(json!({ "meal_id": "b", "calories": 1200 })),
                record(json!({ "calories": "300" })),
            ],
            Utc::now(),
        );

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.filtered, 1);
        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.rejected[0].index, 2);
        assert_eq!(output.reject_ratio(), 0.5);
    }

    #[test]
    fn failed_cast_rejects_record() {
        let transformer = Transformer::new(vec![TransformStep::Cast {
            field: "price".into(),
            to: CastType::Float,
        }]);
        let output = transformer.apply(
            vec![
                record(json!({ "price": "4.50" })),
                record(json!({ "price": "n/a" })),
            ],
            Utc::now(),
        );
        assert_eq!(output.records[0]["price"], json!(4.5));
        assert_eq!(output.rejected.len(), 1);
    }

    #[test]
    fn ne_keeps_missing_fields() {
        let transformer = Transformer::new(vec![TransformStep::Filter {
            field: "status".into(),
            op: FilterOp::Ne,
            value: json!("cancelled"),
        }]);
        let output = transformer.apply(
            vec![
                record(json!({ "status": "cancelled" })),
                record(json!({ "status": "served" })),
                record(json!({})),
            ],
            Utc::now(),
        );
        assert_eq!(output.records.len(), 2);
    }

    #[test]
    fn filter_steps_survive_serde() {
        let steps = vec![
            TransformStep::Filter {
                field: "calories".into(),
                op: FilterOp::Lt,
                value: json!(800),
            },
            TransformStep::Rename {
                from: "qty".into(),
                to: "quantity".into(),
            },
        ];
        let encoded = serde_json::to_value(&steps).unwrap();
        assert_eq!(encoded[0]["step"], "filter");
        assert_eq!(encoded[0]["op"], "lt");

        let decoded: Vec<TransformStep> = serde_json::from_value(json!([
            { "step": "filter", "field": "status", "op": "exists" },
            { "step": "filter", "field": "calories", "op": "lt", "value": 800 },
            { "step": "rename", "from": "qty", "to": "quantity" }
        ]))
        .unwrap();
        assert_eq!(
            decoded[0],
            TransformStep::Filter {
                field: "status".into(),
                op: FilterOp::Exists,
                value: Value::Null,
            }
        );
        assert_eq!(&decoded[1..], steps.as_slice());
    }

    #[test]
    fn validation_flags_empty_fields() {
        let steps = vec![TransformStep::Drop {
            fields: vec![String::new()],
        }];
        assert!(Transformer::validate(&steps).is_err());

        let ordered_on_bool = vec![TransformStep::Filter {
            field: "x".into(),
            op: FilterOp::Gt,
            value: json!(true),
        }];
        assert!(Transformer::validate(&ordered_on_bool).is_err());
    }
}

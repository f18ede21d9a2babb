// src/aggregation.rs
//! Aggregation pipeline: stage parsing and staged execution.
//!
//! A pipeline is an ordered list of single-key stage documents. Parsing
//! turns each into a [`Stage`] variant; `$count` expands into a group
//! plus a projection at parse time. Execution folds the stages over the
//! source collection's full scan.

use crate::document::ID_FIELD;
use crate::error::{Result, ServerError};
use crate::query::{matches_filter, sort_documents};
use crate::value_utils::{compare_values, get_path, set_path, values_equal};
use serde_json::{json, Map, Value};

/// One pipeline stage with its payload.
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Value),
    Skip(i64),
    Limit(i64),
    OrderBy(Value),
    Project(Value),
    Group(Value),
    AddFields(Value),
    Unwind(String),
}

/// A parsed pipeline, ready to run.
#[derive(Debug, Clone)]
pub struct Aggregation {
    stages: Vec<Stage>,
}

impl Aggregation {
    /// Parse a pipeline from stage documents.
    ///
    /// A stage document with more or less than one field fails with code
    /// 40323, an unrecognized stage name with code 40324.
    pub fn parse(pipeline: &[Value]) -> Result<Aggregation> {
        let mut stages = Vec::new();
        for stage_doc in pipeline {
            let obj = stage_doc.as_object().filter(|obj| obj.len() == 1).ok_or_else(|| {
                ServerError::command_named(
                    40323,
                    "Location40323",
                    "A pipeline stage specification object must contain exactly one field.",
                )
            })?;
            let (operation, spec) = obj.iter().next().unwrap();

            match operation.as_str() {
                "$match" => stages.push(Stage::Match(spec.clone())),
                "$skip" => stages.push(Stage::Skip(integer_argument(spec, "$skip")?)),
                "$limit" => stages.push(Stage::Limit(integer_argument(spec, "$limit")?)),
                "$sort" => stages.push(Stage::OrderBy(spec.clone())),
                "$project" => stages.push(Stage::Project(spec.clone())),
                "$count" => {
                    let field = spec.as_str().ok_or_else(|| {
                        ServerError::Exception("$count expects a field name".to_string())
                    })?;
                    stages.push(Stage::Group(
                        json!({ID_FIELD: Value::Null, field: {"$sum": 1}}),
                    ));
                    stages.push(Stage::Project(json!({ID_FIELD: 0})));
                }
                "$group" => stages.push(Stage::Group(spec.clone())),
                "$addFields" => stages.push(Stage::AddFields(spec.clone())),
                "$unwind" => {
                    let path = spec.as_str().ok_or_else(|| {
                        ServerError::Exception("$unwind expects a field path".to_string())
                    })?;
                    let path = path.strip_prefix('$').ok_or_else(|| {
                        ServerError::Exception(
                            "$unwind field path must start with '$'".to_string(),
                        )
                    })?;
                    stages.push(Stage::Unwind(path.to_string()));
                }
                other => {
                    return Err(ServerError::command_named(
                        40324,
                        "Location40324",
                        format!("Unrecognized pipeline stage name: '{}'", other),
                    ))
                }
            }
        }
        Ok(Aggregation { stages })
    }

    /// Run the stages in order over the input documents.
    pub fn run(&self, mut docs: Vec<Value>) -> Result<Vec<Value>> {
        for stage in &self.stages {
            docs = execute_stage(stage, docs)?;
        }
        Ok(docs)
    }
}

fn integer_argument(spec: &Value, stage: &str) -> Result<i64> {
    spec.as_i64()
        .or_else(|| spec.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
        .ok_or_else(|| ServerError::Exception(format!("{} expects an integer", stage)))
}

fn execute_stage(stage: &Stage, docs: Vec<Value>) -> Result<Vec<Value>> {
    match stage {
        Stage::Match(filter) => {
            let mut kept = Vec::new();
            for doc in docs {
                if matches_filter(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        Stage::Skip(n) => {
            let skip = (*n).max(0) as usize;
            Ok(docs.into_iter().skip(skip).collect())
        }
        Stage::Limit(n) => {
            let limit = (*n).max(0) as usize;
            Ok(docs.into_iter().take(limit).collect())
        }
        Stage::OrderBy(order_by) => {
            let mut docs = docs;
            sort_documents(&mut docs, order_by);
            Ok(docs)
        }
        Stage::Project(spec) => docs.iter().map(|doc| project_document(doc, spec)).collect(),
        Stage::Group(spec) => execute_group(spec, &docs),
        Stage::AddFields(spec) => docs
            .into_iter()
            .map(|doc| add_fields(doc, spec))
            .collect(),
        Stage::Unwind(path) => Ok(execute_unwind(path, docs)),
    }
}

/// Evaluate a stage expression against a document: `"$field"` reads the
/// field (missing resolves to null), anything else is a literal.
fn evaluate(doc: &Value, expression: &Value) -> Value {
    if let Some(reference) = expression.as_str().and_then(|s| s.strip_prefix('$')) {
        return get_path(doc, reference).cloned().unwrap_or(Value::Null);
    }
    expression.clone()
}

// Projection here is richer than the find-side one: values may also be
// `"$source"` references that copy another field.
fn project_document(doc: &Value, spec: &Value) -> Result<Value> {
    let spec = spec
        .as_object()
        .ok_or_else(|| ServerError::Exception("$project expects an object".to_string()))?;
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return Ok(doc.clone()),
    };

    let is_exclusion = |v: &Value| matches!(v.as_i64(), Some(0)) || v == &Value::Bool(false);
    let has_inclusions = spec.iter().any(|(_, v)| !is_exclusion(v));
    let has_non_id_exclusions = spec
        .iter()
        .any(|(field, v)| is_exclusion(v) && field != ID_FIELD);
    let include_mode = has_inclusions && !has_non_id_exclusions;

    let mut result = Map::new();
    if include_mode {
        if !spec.get(ID_FIELD).map(is_exclusion).unwrap_or(false) {
            if let Some(id) = obj.get(ID_FIELD) {
                result.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (field, action) in spec {
            if is_exclusion(action) {
                continue;
            }
            let value = if matches!(action.as_i64(), Some(1)) || action == &Value::Bool(true) {
                get_path(doc, field).cloned()
            } else {
                Some(evaluate(doc, action))
            };
            if let Some(value) = value {
                result.insert(field.clone(), value);
            }
        }
    } else {
        for (key, value) in obj {
            if !spec.get(key).map(is_exclusion).unwrap_or(false) {
                result.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(Value::Object(result))
}

fn execute_group(spec: &Value, docs: &[Value]) -> Result<Vec<Value>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| ServerError::Exception("$group expects an object".to_string()))?;
    let id_expression = spec
        .get(ID_FIELD)
        .ok_or_else(|| ServerError::Exception("a group specification must include an _id".to_string()))?;

    // group membership in first-seen order
    let mut groups: Vec<(Value, Vec<&Value>)> = Vec::new();
    for doc in docs {
        let key = evaluate(doc, id_expression);
        match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }
    let mut results = Vec::new();
    for (key, members) in groups {
        let mut result = Map::new();
        result.insert(ID_FIELD.to_string(), key);
        for (field, accumulator) in spec {
            if field == ID_FIELD {
                continue;
            }
            result.insert(field.clone(), accumulate(accumulator, &members)?);
        }
        results.push(Value::Object(result));
    }
    Ok(results)
}

fn accumulate(accumulator: &Value, members: &[&Value]) -> Result<Value> {
    let spec = accumulator
        .as_object()
        .filter(|obj| obj.len() == 1)
        .ok_or_else(|| {
            ServerError::Exception(
                "an accumulator must be a document with exactly one operator".to_string(),
            )
        })?;
    let (operator, argument) = spec.iter().next().unwrap();

    match operator.as_str() {
        "$sum" => {
            let mut total = 0.0;
            for doc in members {
                if let Some(n) = evaluate(doc, argument).as_f64() {
                    total += n;
                }
            }
            Ok(number(total))
        }
        "$avg" => {
            let mut total = 0.0;
            let mut count = 0usize;
            for doc in members {
                if let Some(n) = evaluate(doc, argument).as_f64() {
                    total += n;
                    count += 1;
                }
            }
            if count == 0 {
                Ok(Value::Null)
            } else {
                Ok(Value::from(total / count as f64))
            }
        }
        "$min" => Ok(fold_extremum(members, argument, std::cmp::Ordering::Less)),
        "$max" => Ok(fold_extremum(members, argument, std::cmp::Ordering::Greater)),
        "$first" => Ok(members
            .first()
            .map(|doc| evaluate(doc, argument))
            .unwrap_or(Value::Null)),
        "$last" => Ok(members
            .last()
            .map(|doc| evaluate(doc, argument))
            .unwrap_or(Value::Null)),
        "$push" => Ok(Value::Array(
            members.iter().map(|doc| evaluate(doc, argument)).collect(),
        )),
        other => Err(ServerError::Exception(format!(
            "unsupported group accumulator: {}",
            other
        ))),
    }
}

fn fold_extremum(members: &[&Value], argument: &Value, keep: std::cmp::Ordering) -> Value {
    let mut best: Option<Value> = None;
    for doc in members {
        let candidate = evaluate(doc, argument);
        if candidate.is_null() {
            continue;
        }
        best = Some(match best {
            None => candidate,
            Some(current) => {
                if compare_values(&candidate, &current) == Some(keep) {
                    candidate
                } else {
                    current
                }
            }
        });
    }
    best.unwrap_or(Value::Null)
}

// Sums come out as integers when they are whole, the way clients expect
// counts to look.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn add_fields(doc: Value, spec: &Value) -> Result<Value> {
    let spec = spec
        .as_object()
        .ok_or_else(|| ServerError::Exception("$addFields expects an object".to_string()))?;
    let mut doc = doc;
    for (field, expression) in spec {
        let value = evaluate(&doc, expression);
        set_path(&mut doc, field, value);
    }
    Ok(doc)
}

fn execute_unwind(path: &str, docs: Vec<Value>) -> Vec<Value> {
    let mut results = Vec::new();
    for doc in docs {
        match get_path(&doc, path).cloned() {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut unwound = doc.clone();
                    set_path(&mut unwound, path, item);
                    results.push(unwound);
                }
            }
            // missing or empty fields drop the document, scalars pass through
            Some(Value::Null) | None => {}
            Some(_) => results.push(doc),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pipeline: Value, docs: Vec<Value>) -> Vec<Value> {
        Aggregation::parse(pipeline.as_array().unwrap())
            .unwrap()
            .run(docs)
            .unwrap()
    }

    #[test]
    fn test_stage_document_must_have_one_field() {
        let err = Aggregation::parse(&[json!({"$match": {}, "$limit": 1})]).unwrap_err();
        assert_eq!(err.code(), Some(40323));
        let err = Aggregation::parse(&[json!({})]).unwrap_err();
        assert_eq!(err.code(), Some(40323));
    }

    #[test]
    fn test_unrecognized_stage() {
        let err = Aggregation::parse(&[json!({"$explode": {}})]).unwrap_err();
        assert_eq!(err.code(), Some(40324));
        assert!(err.message().contains("$explode"));
    }

    #[test]
    fn test_match_skip_limit_sort() {
        let docs = vec![
            json!({"_id": 1, "n": 4}),
            json!({"_id": 2, "n": 2}),
            json!({"_id": 3, "n": 3}),
            json!({"_id": 4, "n": 1}),
        ];
        let result = run(
            json!([
                {"$match": {"n": {"$gt": 1}}},
                {"$sort": {"n": 1}},
                {"$skip": 1},
                {"$limit": 1},
            ]),
            docs,
        );
        assert_eq!(result, vec![json!({"_id": 3, "n": 3})]);
    }

    #[test]
    fn test_count_expands_to_group_and_project() {
        let docs = vec![
            json!({"_id": 1, "a": "x"}),
            json!({"_id": 2, "a": "x"}),
            json!({"_id": 3, "a": "y"}),
        ];
        let result = run(
            json!([{"$match": {"a": "x"}}, {"$count": "total"}]),
            docs,
        );
        assert_eq!(result, vec![json!({"total": 2})]);
    }

    #[test]
    fn test_group_by_field() {
        let docs = vec![
            json!({"_id": 1, "city": "NYC", "amount": 10}),
            json!({"_id": 2, "city": "LA", "amount": 5}),
            json!({"_id": 3, "city": "NYC", "amount": 7}),
        ];
        let result = run(
            json!([{"$group": {
                "_id": "$city",
                "total": {"$sum": "$amount"},
                "top": {"$max": "$amount"},
                "first": {"$first": "$_id"},
            }}]),
            docs,
        );
        assert_eq!(
            result,
            vec![
                json!({"_id": "NYC", "total": 17, "top": 10, "first": 1}),
                json!({"_id": "LA", "total": 5, "top": 5, "first": 2}),
            ]
        );
    }

    #[test]
    fn test_group_avg_and_push() {
        let docs = vec![json!({"_id": 1, "n": 1}), json!({"_id": 2, "n": 2})];
        let result = run(
            json!([{"$group": {"_id": null, "avg": {"$avg": "$n"}, "all": {"$push": "$n"}}}]),
            docs,
        );
        assert_eq!(result, vec![json!({"_id": null, "avg": 1.5, "all": [1, 2]})]);
    }

    #[test]
    fn test_project_rename_and_exclude() {
        let docs = vec![json!({"_id": 1, "a": "x", "b": "y"})];
        let result = run(json!([{"$project": {"renamed": "$a", "_id": 0}}]), docs.clone());
        assert_eq!(result, vec![json!({"renamed": "x"})]);

        let result = run(json!([{"$project": {"b": 0}}]), docs);
        assert_eq!(result, vec![json!({"_id": 1, "a": "x"})]);
    }

    #[test]
    fn test_add_fields() {
        let docs = vec![json!({"_id": 1, "a": 2})];
        let result = run(json!([{"$addFields": {"copy": "$a", "constant": 7}}]), docs);
        assert_eq!(result, vec![json!({"_id": 1, "a": 2, "copy": 2, "constant": 7})]);
    }

    #[test]
    fn test_unwind() {
        let docs = vec![
            json!({"_id": 1, "tags": ["a", "b"]}),
            json!({"_id": 2, "tags": []}),
            json!({"_id": 3}),
        ];
        let result = run(json!([{"$unwind": "$tags"}]), docs);
        assert_eq!(
            result,
            vec![
                json!({"_id": 1, "tags": "a"}),
                json!({"_id": 1, "tags": "b"}),
            ]
        );
    }

    #[test]
    fn test_unwind_requires_dollar_path() {
        assert!(Aggregation::parse(&[json!({"$unwind": "tags"})]).is_err());
    }

    #[test]
    fn test_group_over_empty_input_yields_nothing() {
        let result = run(json!([{"$count": "total"}]), vec![]);
        assert_eq!(result, Vec::<Value>::new());
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let docs = vec![json!({"_id": 1})];
        assert_eq!(run(json!([]), docs.clone()), docs);
    }
}

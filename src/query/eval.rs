use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

use serde_json::Value;

use super::{
    CompareOp, FilterExpr, Literal, Operand, OrderKey, PropertyPath, PropertyRoot, Query,
    SortDirection,
};
use crate::{errors::SensorGraphError, model::Entity};

/// Evaluation budget measured from construction.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn new(budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn check(&self) -> Result<(), SensorGraphError> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(SensorGraphError::TimeoutError {
                    elapsed_ms: self.started.elapsed().as_millis(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Filtered, ordered and paginated entities, before projection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Entity>,
    pub total_count: Option<usize>,
    pub next_skip: Option<usize>,
}

/// Runs filter, count, ordering and pagination over `candidates`.
///
/// Candidates must arrive in ascending identifier order. Without `$orderby` and `$count` the
/// candidates are pulled only until the page (plus one look-ahead entity) is complete.
pub fn evaluate<I>(
    query: &Query,
    candidates: I,
    deadline: &Deadline,
) -> Result<Page, SensorGraphError>
where
    I: IntoIterator<Item = Result<Entity, SensorGraphError>>,
{
    deadline.check()?;
    if query.order_by.is_empty() && !query.count {
        return evaluate_streaming(query, candidates, deadline);
    }
    let mut matched = Vec::new();
    for candidate in candidates {
        deadline.check()?;
        let entity = candidate?;
        if matches_filter(query.filter.as_ref(), &entity) {
            matched.push(entity);
        }
    }
    let total_count = query.count.then_some(matched.len());
    matched.sort_by(|a, b| compare_entities(&query.order_by, a, b));
    deadline.check()?;

    let len = matched.len();
    let start = query.skip.min(len);
    let end = match query.top {
        Some(top) => start.saturating_add(top).min(len),
        None => len,
    };
    let items: Vec<Entity> = matched.drain(start..end).collect();
    Ok(Page {
        items,
        total_count,
        next_skip: (end < len).then_some(end),
    })
}

fn evaluate_streaming<I>(
    query: &Query,
    candidates: I,
    deadline: &Deadline,
) -> Result<Page, SensorGraphError>
where
    I: IntoIterator<Item = Result<Entity, SensorGraphError>>,
{
    let mut skipped = 0;
    let mut items = Vec::new();
    let mut more = false;
    for candidate in candidates {
        deadline.check()?;
        let entity = candidate?;
        if !matches_filter(query.filter.as_ref(), &entity) {
            continue;
        }
        if skipped < query.skip {
            skipped += 1;
            continue;
        }
        if query.top.is_some_and(|top| items.len() >= top) {
            more = true;
            break;
        }
        items.push(entity);
    }
    let next_skip = more.then_some(query.skip + items.len());
    Ok(Page {
        items,
        total_count: None,
        next_skip,
    })
}

pub(crate) fn matches_filter(filter: Option<&FilterExpr>, entity: &Entity) -> bool {
    match filter {
        None => true,
        Some(expr) => eval_expr(expr, entity),
    }
}

fn eval_expr(expr: &FilterExpr, entity: &Entity) -> bool {
    match expr {
        FilterExpr::And(left, right) => eval_expr(left, entity) && eval_expr(right, entity),
        FilterExpr::Or(left, right) => eval_expr(left, entity) || eval_expr(right, entity),
        FilterExpr::Not(inner) => !eval_expr(inner, entity),
        FilterExpr::Compare { left, op, right } => {
            let lhs = operand_value(left, entity);
            let rhs = operand_value(right, entity);
            apply(*op, &lhs, &rhs)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Scalar<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'a str),
    Json(&'a Value),
}

impl Scalar<'_> {
    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 2,
            Scalar::Str(_) => 3,
            Scalar::Json(_) => 4,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(value) => Some(*value as f64),
            Scalar::Float(value) => Some(*value),
            _ => None,
        }
    }
}

fn operand_value<'a>(operand: &'a Operand, entity: &'a Entity) -> Scalar<'a> {
    match operand {
        Operand::Literal(literal) => match literal {
            Literal::Null => Scalar::Null,
            Literal::Bool(value) => Scalar::Bool(*value),
            Literal::Int(value) => Scalar::Int(*value),
            Literal::Float(value) => Scalar::Float(*value),
            Literal::Str(value) => Scalar::Str(value),
        },
        Operand::Property(path) => property_value(path, entity),
    }
}

fn property_value<'a>(path: &PropertyPath, entity: &'a Entity) -> Scalar<'a> {
    let mut value = match path.root {
        PropertyRoot::Id => {
            return match &entity.id {
                Some(id) => Scalar::Str(id.as_str()),
                None => Scalar::Null,
            };
        }
        PropertyRoot::Property(def) => match entity.properties.get(def.name) {
            Some(value) => value,
            None => return Scalar::Null,
        },
    };
    for step in &path.steps {
        let next = match value {
            Value::Object(map) => map.get(step.as_str()),
            Value::Array(items) => step.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(inner) => value = inner,
            None => return Scalar::Null,
        }
    }
    scalar(value)
}

fn scalar(value: &Value) -> Scalar<'_> {
    match value {
        Value::Null => Scalar::Null,
        Value::Bool(flag) => Scalar::Bool(*flag),
        Value::Number(number) => match number.as_i64() {
            Some(int) => Scalar::Int(int),
            None => number.as_f64().map_or(Scalar::Json(value), Scalar::Float),
        },
        Value::String(text) => Scalar::Str(text),
        Value::Array(_) | Value::Object(_) => Scalar::Json(value),
    }
}

/// Ordering between values of the same kind; `None` when they are not comparable.
fn compare_same_kind(lhs: &Scalar<'_>, rhs: &Scalar<'_>) -> Option<Ordering> {
    match (lhs, rhs) {
        (Scalar::Null, Scalar::Null) => Some(Ordering::Equal),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Json(a), Scalar::Json(b)) => (a == b).then_some(Ordering::Equal),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn apply(op: CompareOp, lhs: &Scalar<'_>, rhs: &Scalar<'_>) -> bool {
    let ordering = compare_same_kind(lhs, rhs);
    match op {
        CompareOp::Eq => ordering == Some(Ordering::Equal),
        CompareOp::Ne => ordering != Some(Ordering::Equal),
        _ if matches!(lhs, Scalar::Null) || matches!(rhs, Scalar::Null) => false,
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Total order used by `$orderby`: nulls first, then by kind, then by value.
fn sort_order(lhs: &Scalar<'_>, rhs: &Scalar<'_>) -> Ordering {
    lhs.rank().cmp(&rhs.rank()).then_with(|| match (lhs, rhs) {
        (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
        (Scalar::Json(a), Scalar::Json(b)) => a.to_string().cmp(&b.to_string()),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => compare_same_kind(a, b).unwrap_or(Ordering::Equal),
        },
    })
}

/// Sort keys in order, then ascending identifier so equal keys page deterministically.
fn compare_entities(keys: &[OrderKey], a: &Entity, b: &Entity) -> Ordering {
    for key in keys {
        let ordering = sort_order(&property_value(&key.path, a), &property_value(&key.path, b));
        let ordering = match key.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id.cmp(&b.id)
}

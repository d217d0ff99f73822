//! OData-style query options: `$filter`, `$orderby`, `$count`, `$top`, `$skip`, `$select` and
//! `$expand`, parsed against the schema of the path's target type.

mod eval;
mod lexer;
mod parser;

use std::fmt;

use crate::{
    model::Entity,
    registry::{EntityType, PropertyDef, Relation},
};

pub use eval::{Deadline, Page, evaluate};
pub use parser::{parse_filter, parse_query};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            _ => return None,
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyRoot {
    /// The identifier pseudo-property (`id`, `@id`, `@iot.id`).
    Id,
    Property(&'static PropertyDef),
}

impl PropertyRoot {
    pub fn name(&self) -> &'static str {
        match self {
            PropertyRoot::Id => "@iot.id",
            PropertyRoot::Property(def) => def.name,
        }
    }
}

/// Schema property, optionally descending into its JSON value (`unitOfMeasurement/symbol`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyPath {
    pub root: PropertyRoot,
    pub steps: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Property(PropertyPath),
    Literal(Literal),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterExpr {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderKey {
    pub path: PropertyPath,
    pub direction: SortDirection,
}

/// Chain of relations to embed, e.g. `Datastreams/Observations`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpandPath {
    pub relations: Vec<&'static Relation>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub entity_type: EntityType,
    pub filter: Option<FilterExpr>,
    pub order_by: Vec<OrderKey>,
    pub count: bool,
    pub top: Option<usize>,
    pub skip: usize,
    pub select: Option<Vec<PropertyRoot>>,
    pub expand: Vec<ExpandPath>,
}

impl Query {
    /// Query without options: every entity, identifier order, no page limit.
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            filter: None,
            order_by: Vec::new(),
            count: false,
            top: None,
            skip: 0,
            select: None,
            expand: Vec::new(),
        }
    }

    /// Applies `$select`. The identifier is always kept.
    pub fn project(&self, entity: &mut Entity) {
        let Some(select) = &self.select else {
            return;
        };
        entity.properties.retain(|name, _| {
            select.iter().any(|root| match root {
                PropertyRoot::Property(def) => def.name == name,
                PropertyRoot::Id => false,
            })
        });
    }
}

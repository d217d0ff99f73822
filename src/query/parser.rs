use ahash::AHashSet;
use percent_encoding::percent_decode_str;
use tracing::debug;

use super::{
    CompareOp, ExpandPath, FilterExpr, Literal, Operand, OrderKey, PropertyPath, PropertyRoot,
    Query, SortDirection,
    lexer::{Token, tokenize},
};
use crate::{
    config::QuerySettings,
    errors::SensorGraphError,
    registry::{self, EntityType, PropertyKind},
};

/// Parses an `&`-joined option string for a query whose results are `target` entities.
///
/// All names are checked against the schema here, so evaluation never meets an unknown
/// property. `$top` falls back to `settings.default_top` and is clamped to `settings.max_top`;
/// with `default_top: None` a query without `$top` returns every matching entity.
pub fn parse_query(
    input: &str,
    target: EntityType,
    settings: &QuerySettings,
) -> Result<Query, SensorGraphError> {
    let mut query = Query::new(target);
    let mut seen = AHashSet::new();
    let mut top = None;
    for part in input.trim_start_matches('?').split('&') {
        if part.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = part
            .split_once('=')
            .ok_or_else(|| SensorGraphError::syntax(format!("option '{part}' has no value")))?;
        let key = decode(raw_key)?;
        let value = decode(raw_value)?;
        if key.is_empty() {
            return Err(SensorGraphError::syntax("empty option name"));
        }
        if !seen.insert(key.clone()) {
            return Err(SensorGraphError::syntax(format!("duplicate option {key}")));
        }
        match key.as_str() {
            "$filter" => query.filter = Some(parse_filter(&value, target)?),
            "$orderby" => query.order_by = parse_order_by(&value, target)?,
            "$count" => query.count = parse_bool_option(&key, &value)?,
            "$top" => top = Some(parse_count_option(&key, &value)?),
            "$skip" => query.skip = parse_count_option(&key, &value)?,
            "$select" => query.select = Some(parse_select(&value, target)?),
            "$expand" => query.expand = parse_expand(&value, target)?,
            _ => return Err(SensorGraphError::unsupported_option(key)),
        }
    }
    query.top = top
        .or(settings.default_top)
        .map(|top| top.min(settings.max_top));
    debug!(
        entity_type = %target,
        filter = query.filter.is_some(),
        order_keys = query.order_by.len(),
        count = query.count,
        "parsed query options"
    );
    Ok(query)
}

fn decode(raw: &str) -> Result<String, SensorGraphError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|text| text.into_owned())
        .map_err(|e| SensorGraphError::syntax(format!("invalid percent-encoding: {e}")))
}

fn parse_bool_option(key: &str, value: &str) -> Result<bool, SensorGraphError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(SensorGraphError::syntax(format!(
            "{key} expects true or false, got '{other}'"
        ))),
    }
}

fn parse_count_option(key: &str, value: &str) -> Result<usize, SensorGraphError> {
    value.trim().parse::<usize>().map_err(|_| {
        SensorGraphError::syntax(format!(
            "{key} expects a non-negative integer, got '{value}'"
        ))
    })
}

fn parse_order_by(value: &str, target: EntityType) -> Result<Vec<OrderKey>, SensorGraphError> {
    let mut keys = Vec::new();
    for clause in value.split(',') {
        let mut words = clause.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| SensorGraphError::syntax("empty $orderby clause"))?;
        let direction = match words.next() {
            None | Some("asc") => SortDirection::Asc,
            Some("desc") => SortDirection::Desc,
            Some(other) => {
                return Err(SensorGraphError::syntax(format!(
                    "unknown sort direction '{other}'"
                )));
            }
        };
        if let Some(extra) = words.next() {
            return Err(SensorGraphError::syntax(format!(
                "unexpected '{extra}' in $orderby"
            )));
        }
        keys.push(OrderKey {
            path: resolve_property(name, target)?,
            direction,
        });
    }
    Ok(keys)
}

fn parse_select(value: &str, target: EntityType) -> Result<Vec<PropertyRoot>, SensorGraphError> {
    let mut roots = Vec::new();
    for name in value.split(',').map(str::trim) {
        if name.is_empty() {
            return Err(SensorGraphError::syntax("empty $select entry"));
        }
        let path = resolve_property(name, target)?;
        if !path.steps.is_empty() {
            return Err(SensorGraphError::syntax(format!(
                "$select takes top-level properties, got '{name}'"
            )));
        }
        if !roots.contains(&path.root) {
            roots.push(path.root);
        }
    }
    Ok(roots)
}

fn parse_expand(value: &str, target: EntityType) -> Result<Vec<ExpandPath>, SensorGraphError> {
    let mut paths = Vec::new();
    for entry in value.split(',').map(str::trim) {
        if entry.is_empty() {
            return Err(SensorGraphError::syntax("empty $expand entry"));
        }
        let mut current = target;
        let mut relations = Vec::new();
        for name in entry.split('/') {
            let relation = current
                .schema()
                .relation(name)
                .ok_or_else(|| SensorGraphError::unknown_property(current, name))?;
            relations.push(relation);
            current = relation.target;
        }
        paths.push(ExpandPath { relations });
    }
    Ok(paths)
}

fn resolve_property(text: &str, target: EntityType) -> Result<PropertyPath, SensorGraphError> {
    let mut parts = text.split('/');
    let head = parts.next().unwrap_or_default();
    let steps: Vec<String> = parts.map(str::to_string).collect();
    if steps.iter().any(String::is_empty) {
        return Err(SensorGraphError::syntax(format!("malformed property path '{text}'")));
    }
    let root = if registry::is_id_alias(head) {
        if !steps.is_empty() {
            return Err(SensorGraphError::syntax(format!(
                "identifier has no members: '{text}'"
            )));
        }
        PropertyRoot::Id
    } else {
        let def = target
            .schema()
            .property(head)
            .ok_or_else(|| SensorGraphError::unknown_property(target, head))?;
        PropertyRoot::Property(def)
    };
    Ok(PropertyPath { root, steps })
}

/// Parses a `$filter` expression for `target`.
pub fn parse_filter(input: &str, target: EntityType) -> Result<FilterExpr, SensorGraphError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(SensorGraphError::syntax("empty $filter"));
    }
    let mut parser = FilterParser {
        tokens,
        pos: 0,
        target,
    };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(SensorGraphError::syntax(format!(
            "unexpected {token:?} after expression"
        )));
    }
    Ok(expr)
}

struct FilterParser {
    tokens: Vec<Token>,
    pos: usize,
    target: EntityType,
}

impl FilterParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word == keyword)
    }

    fn parse_or(&mut self) -> Result<FilterExpr, SensorGraphError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr, SensorGraphError> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, SensorGraphError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpr, SensorGraphError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                other => Err(SensorGraphError::syntax(format!(
                    "expected ')' but found {other:?}"
                ))),
            };
        }
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Word(word)) => CompareOp::from_keyword(&word).ok_or_else(|| {
                SensorGraphError::syntax(format!("expected comparison operator, found '{word}'"))
            })?,
            other => {
                return Err(SensorGraphError::syntax(format!(
                    "expected comparison operator, found {other:?}"
                )));
            }
        };
        let right = self.parse_operand()?;
        check_operand_types(&left, op, &right)?;
        Ok(FilterExpr::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, SensorGraphError> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Operand::Literal(Literal::Str(text))),
            Some(Token::Int(value)) => Ok(Operand::Literal(Literal::Int(value))),
            Some(Token::Float(value)) => Ok(Operand::Literal(Literal::Float(value))),
            Some(Token::Word(word)) => match word.as_str() {
                "true" => Ok(Operand::Literal(Literal::Bool(true))),
                "false" => Ok(Operand::Literal(Literal::Bool(false))),
                "null" => Ok(Operand::Literal(Literal::Null)),
                "and" | "or" | "not" | "eq" | "ne" | "gt" | "ge" | "lt" | "le" => Err(
                    SensorGraphError::syntax(format!("expected operand, found keyword '{word}'")),
                ),
                _ => Ok(Operand::Property(resolve_property(&word, self.target)?)),
            },
            other => Err(SensorGraphError::syntax(format!(
                "expected operand, found {other:?}"
            ))),
        }
    }
}

/// Text properties (and the identifier) only compare against string literals or null.
fn check_operand_types(
    left: &Operand,
    op: CompareOp,
    right: &Operand,
) -> Result<(), SensorGraphError> {
    for (property, other) in [(left, right), (right, left)] {
        let (Operand::Property(path), Operand::Literal(literal)) = (property, other) else {
            continue;
        };
        let is_text = match path.root {
            PropertyRoot::Id => true,
            PropertyRoot::Property(def) => def.kind == PropertyKind::Text && path.steps.is_empty(),
        };
        if is_text && !matches!(literal, Literal::Str(_) | Literal::Null) {
            return Err(SensorGraphError::syntax(format!(
                "cannot compare text property {} {op} {literal:?}",
                path.root.name()
            )));
        }
    }
    Ok(())
}

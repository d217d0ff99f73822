//! Resource path parsing: `/Things('t1')/Datastreams` into a validated navigation chain.

use std::fmt;

use tracing::debug;

use crate::{
    errors::SensorGraphError,
    model::Identifier,
    registry::{self, EntityType, Relation},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathSegment {
    pub entity_type: EntityType,
    pub id: Option<Identifier>,
    /// Relation followed from the previous segment; `None` on the first one.
    pub via: Option<&'static Relation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePath {
    segments: Vec<PathSegment>,
}

impl ResourcePath {
    pub fn collection(entity_type: EntityType) -> Self {
        Self {
            segments: vec![PathSegment {
                entity_type,
                id: None,
                via: None,
            }],
        }
    }

    pub fn instance(entity_type: EntityType, id: Identifier) -> Self {
        Self {
            segments: vec![PathSegment {
                entity_type,
                id: Some(id),
                via: None,
            }],
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn terminal(&self) -> &PathSegment {
        // parse_path and the constructors never build an empty chain
        &self.segments[self.segments.len() - 1]
    }

    pub fn target_type(&self) -> EntityType {
        self.terminal().entity_type
    }

    /// True when the path addresses one entity rather than a collection.
    pub fn is_instance(&self) -> bool {
        let terminal = self.terminal();
        terminal.id.is_some() || terminal.via.is_some_and(|rel| rel.is_to_one())
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            let name = match segment.via {
                Some(rel) => rel.name,
                None => segment.entity_type.plural(),
            };
            write!(f, "/{name}")?;
            if let Some(id) = &segment.id {
                write!(f, "('{}')", id.as_str().replace('\'', "''"))?;
            }
        }
        Ok(())
    }
}

pub fn parse_path(path: &str) -> Result<ResourcePath, SensorGraphError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(SensorGraphError::invalid_segment(0, path, "empty path"));
    }
    let raw_segments = split_segments(trimmed)?;
    let mut segments: Vec<PathSegment> = Vec::with_capacity(raw_segments.len());
    for (index, raw) in raw_segments.iter().enumerate() {
        let (name, id) = split_identifier(index, raw)?;
        let segment = match segments.last() {
            None => {
                let entity_type = registry::lookup(name).map_err(|_| {
                    SensorGraphError::invalid_segment(index, *raw, "unknown entity set")
                })?;
                PathSegment {
                    entity_type,
                    id,
                    via: None,
                }
            }
            Some(previous) => {
                let single = previous.id.is_some() || previous.via.is_some_and(Relation::is_to_one);
                if !single {
                    return Err(SensorGraphError::invalid_traversal(
                        index,
                        *raw,
                        "navigation must follow a single entity",
                    ));
                }
                let relation = navigation(index, raw, name, previous.entity_type)?;
                PathSegment {
                    entity_type: relation.target,
                    id,
                    via: Some(relation),
                }
            }
        };
        segments.push(segment);
    }
    debug!(path, segments = segments.len(), "parsed resource path");
    Ok(ResourcePath { segments })
}

fn navigation(
    index: usize,
    raw: &str,
    name: &str,
    from: EntityType,
) -> Result<&'static Relation, SensorGraphError> {
    if let Some(relation) = from.schema().relation(name) {
        return Ok(relation);
    }
    let target = registry::lookup(name)
        .ok()
        .or_else(|| registry::lookup_singular(name))
        .ok_or_else(|| SensorGraphError::invalid_segment(index, raw, "unknown entity name"))?;
    registry::relation_between(from, target).ok_or_else(|| {
        SensorGraphError::invalid_traversal(
            index,
            raw,
            format!("{from} has no relation to {target}"),
        )
    })
}

/// Splits on `/` outside single-quoted identifier literals.
fn split_segments(path: &str) -> Result<Vec<&str>, SensorGraphError> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (pos, ch) in path.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '/' if !in_quote => {
                segments.push(&path[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(SensorGraphError::invalid_segment(
            segments.len(),
            &path[start..],
            "unterminated identifier literal",
        ));
    }
    segments.push(&path[start..]);
    if let Some(index) = segments.iter().position(|segment| segment.is_empty()) {
        return Err(SensorGraphError::invalid_segment(
            index,
            "",
            "empty segment",
        ));
    }
    Ok(segments)
}

fn split_identifier(
    index: usize,
    raw: &str,
) -> Result<(&str, Option<Identifier>), SensorGraphError> {
    let Some(open) = raw.find('(') else {
        if raw.contains(')') || raw.contains('\'') {
            return Err(SensorGraphError::invalid_segment(
                index,
                raw,
                "unexpected character in entity name",
            ));
        }
        return Ok((raw, None));
    };
    let Some(inner) = raw[open + 1..].strip_suffix(')') else {
        return Err(SensorGraphError::invalid_segment(
            index,
            raw,
            "identifier must be closed by ')'",
        ));
    };
    let name = &raw[..open];
    if name.is_empty() {
        return Err(SensorGraphError::invalid_segment(index, raw, "missing entity name"));
    }
    let literal = parse_identifier_literal(inner)
        .ok_or_else(|| SensorGraphError::invalid_segment(index, raw, "malformed identifier"))?;
    Ok((name, Some(literal)))
}

fn parse_identifier_literal(inner: &str) -> Option<Identifier> {
    if let Some(quoted) = inner.strip_prefix('\'') {
        let body = quoted.strip_suffix('\'')?;
        if body.replace("''", "").contains('\'') {
            return None;
        }
        let value = body.replace("''", "'");
        if value.is_empty() {
            return None;
        }
        return Some(Identifier::new(value));
    }
    if inner.is_empty() || inner.contains(['\'', '(', ')']) {
        return None;
    }
    Some(Identifier::new(inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_identifiers_keep_slashes() {
        let path = parse_path("/Things('a/b')/Datastreams").expect("path");
        assert_eq!(path.segments().len(), 2);
        assert_eq!(path.segments()[0].id.as_ref().unwrap().as_str(), "a/b");
    }

    #[test]
    fn doubled_quote_unescapes() {
        let path = parse_path("/Things('it''s')").expect("path");
        assert_eq!(path.terminal().id.as_ref().unwrap().as_str(), "it's");
        assert_eq!(path.to_string(), "/Things('it''s')");
    }

    #[test]
    fn unbalanced_parenthesis_is_rejected() {
        let err = parse_path("/Things(abc").expect_err("invalid");
        assert!(matches!(
            err,
            SensorGraphError::InvalidPathSegment { index: 0, .. }
        ));
    }
}

//! Dot-separated topic patterns with single-segment wildcards.

use crate::BusError;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A parsed subscription pattern, e.g. `marketdata.*.*.trades`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Parse a pattern; `*` matches exactly one segment.
    pub fn parse(pattern: &str) -> Result<Self, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidPattern("empty pattern".into()));
        }
        let segments = pattern
            .split('.')
            .map(|seg| {
                if seg.is_empty() {
                    Err(BusError::InvalidPattern(format!("empty segment in '{pattern}'")))
                } else if seg == "*" {
                    Ok(Segment::Wildcard)
                } else {
                    Ok(Segment::Literal(seg.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match (parts.next(), segment) {
                (Some(_), Segment::Wildcard) => {}
                (Some(part), Segment::Literal(lit)) if part == lit => {}
                _ => return false,
            }
        }
        parts.next().is_none()
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A validated event topic: lowercase, dot-separated, non-empty segments.
///
/// Mixed-case input is normalised to lowercase on parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn parse(input: &str) -> Result<Self> {
        let normalised = input.trim().to_ascii_lowercase();
        if normalised.is_empty() {
            return Err(Error::invalid_argument("topic must not be empty"));
        }
        for segment in normalised.split('.') {
            if segment.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "topic '{input}' contains an empty segment"
                )));
            }
            if segment.contains('*') {
                return Err(Error::invalid_argument(format!(
                    "topic '{input}' may not contain wildcards; use a pattern"
                )));
            }
        }
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A subscription pattern: either an exact topic or a dotted prefix with a
/// trailing `*` that matches the whole subtree (the prefix itself included).
///
/// `*` on its own subscribes to every topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    Exact(Topic),
    Prefix(Vec<String>),
}

impl TopicPattern {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim().to_ascii_lowercase();
        if trimmed == "*" {
            return Ok(Self::Prefix(Vec::new()));
        }
        if let Some(prefix) = trimmed.strip_suffix(".*") {
            let topic = Topic::parse(prefix)?;
            return Ok(Self::Prefix(
                topic.segments().map(str::to_string).collect(),
            ));
        }
        if trimmed.contains('*') {
            return Err(Error::invalid_argument(format!(
                "pattern '{input}' may only use a trailing '.*' wildcard"
            )));
        }
        Ok(Self::Exact(Topic::parse(&trimmed)?))
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            Self::Exact(exact) => exact == topic,
            Self::Prefix(prefix) => {
                let segments: Vec<&str> = topic.segments().collect();
                segments.len() >= prefix.len()
                    && prefix.iter().zip(&segments).all(|(p, s)| p == s)
            }
        }
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(topic) => write!(f, "{topic}"),
            Self::Prefix(prefix) if prefix.is_empty() => write!(f, "*"),
            Self::Prefix(prefix) => write!(f, "{}.*", prefix.join(".")),
        }
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse_normalises_case() {
        let topic = Topic::parse("FHIR.Patient.Read").unwrap();
        assert_eq!(topic.as_str(), "fhir.patient.read");
        assert_eq!(topic.segments().count(), 3);
    }

    #[test]
    fn test_topic_rejects_empty_segments() {
        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("fhir..read").is_err());
        assert!(Topic::parse(".fhir").is_err());
        assert!(Topic::parse("fhir.").is_err());
    }

    #[test]
    fn test_topic_rejects_wildcards() {
        assert!(Topic::parse("fhir.*").is_err());
    }

    #[test]
    fn test_exact_pattern_matching() {
        let pattern = TopicPattern::parse("fhir.read").unwrap();
        assert!(pattern.matches(&Topic::parse("fhir.read").unwrap()));
        assert!(!pattern.matches(&Topic::parse("fhir.patient.read").unwrap()));
    }

    #[test]
    fn test_prefix_pattern_matches_subtree() {
        let pattern = TopicPattern::parse("fhir.patient.*").unwrap();
        assert!(pattern.matches(&Topic::parse("fhir.patient.read").unwrap()));
        assert!(pattern.matches(&Topic::parse("fhir.patient.update").unwrap()));
        assert!(pattern.matches(&Topic::parse("fhir.patient").unwrap()));
        assert!(!pattern.matches(&Topic::parse("fhir.encounter.read").unwrap()));
    }

    #[test]
    fn test_star_matches_everything() {
        let pattern = TopicPattern::parse("*").unwrap();
        assert!(pattern.matches(&Topic::parse("ehr.generic").unwrap()));
        assert!(pattern.matches(&Topic::parse("cds.patient.view").unwrap()));
    }

    #[test]
    fn test_inner_wildcard_rejected() {
        assert!(TopicPattern::parse("fhir.*.read").is_err());
        assert!(TopicPattern::parse("fhir*").is_err());
    }

    #[test]
    fn test_pattern_display_roundtrip() {
        for raw in ["fhir.read", "fhir.patient.*", "*"] {
            let pattern = TopicPattern::parse(raw).unwrap();
            assert_eq!(pattern.to_string(), raw);
        }
    }
}

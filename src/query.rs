//! Registry queries: filter-expression construction and matching.
//!
//! A query selects capability instances by type and properties, using the
//! classic parenthesized filter syntax: `(key=value)` terms composed with
//! `(&...)`, `(|...)` and `(!...)`. The special attribute `objectClass`
//! matches a capability's `type_name`. Values may contain `*` wildcards.
//!
//! Construction is fail-fast: a query built from neither a fragment nor a
//! type is a configuration error.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::BuildError;

/// Attribute that filter expressions use to select on capability type.
pub const TYPE_ATTRIBUTE: &str = "objectClass";

/// A validated registry query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query {
    expression: String,
}

impl Query {
    /// Builds a query from an optional filter fragment and an optional
    /// capability type.
    ///
    /// Both present: conjunction `(&(frag)(objectClass=Type))`. Only one
    /// present: that one, as-is. Neither: [`BuildError::EmptyQuery`].
    pub fn build(fragment: Option<&str>, type_name: Option<&str>) -> Result<Self, BuildError> {
        let expression = match (fragment, type_name) {
            (None, None) => return Err(BuildError::EmptyQuery),
            (Some(frag), None) => frag.to_string(),
            (None, Some(ty)) => format!("({TYPE_ATTRIBUTE}={ty})"),
            (Some(frag), Some(ty)) => format!("(&{frag}({TYPE_ATTRIBUTE}={ty}))"),
        };

        // Validate eagerly so malformed fragments fail at build time,
        // not at subscribe time.
        Filter::parse(&expression)?;

        Ok(Self { expression })
    }

    /// Builds a query selecting every capability of one type.
    pub fn of_type(type_name: &str) -> Result<Self, BuildError> {
        Self::build(None, Some(type_name))
    }

    /// The filter expression this query carries.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Parses the expression into a matcher.
    pub fn filter(&self) -> Result<Filter, BuildError> {
        Filter::parse(&self.expression)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// How a filter term compares an attribute value.
#[derive(Debug, Clone)]
enum ValueTest {
    /// Attribute must exist, value is irrelevant (`(attr=*)`).
    Present,
    /// Scalar rendering must equal the literal.
    Exact(String),
    /// Scalar rendering must match the `*`-wildcard pattern.
    Wildcard(Regex),
}

/// A parsed filter expression, ready to match capabilities.
#[derive(Debug, Clone)]
pub struct Filter {
    node: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Term { attribute: String, test: ValueTest },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

impl Filter {
    /// Parses a filter expression.
    pub fn parse(input: &str) -> Result<Self, BuildError> {
        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        let node = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(malformed(format!(
                "trailing input at byte {}",
                parser.pos
            )));
        }
        Ok(Self { node })
    }

    /// Returns true if the capability satisfies this filter.
    #[must_use]
    pub fn matches(&self, capability: &Capability) -> bool {
        self.node.matches(capability)
    }
}

impl Node {
    fn matches(&self, capability: &Capability) -> bool {
        match self {
            Self::Term { attribute, test } => match_term(attribute, test, capability),
            Self::And(inner) => inner.iter().all(|n| n.matches(capability)),
            Self::Or(inner) => inner.iter().any(|n| n.matches(capability)),
            Self::Not(inner) => !inner.matches(capability),
        }
    }
}

fn match_term(attribute: &str, test: &ValueTest, capability: &Capability) -> bool {
    if attribute == TYPE_ATTRIBUTE {
        return match test {
            ValueTest::Present => true,
            ValueTest::Exact(expected) => capability.type_name == *expected,
            ValueTest::Wildcard(re) => re.is_match(&capability.type_name),
        };
    }

    let Some(value) = capability.property(attribute) else {
        return false;
    };

    match test {
        ValueTest::Present => true,
        ValueTest::Exact(expected) => value
            .as_filter_text()
            .is_some_and(|text| text == *expected),
        ValueTest::Wildcard(re) => value
            .as_filter_text()
            .is_some_and(|text| re.is_match(&text)),
    }
}

fn malformed(reason: impl Into<String>) -> BuildError {
    BuildError::MalformedFilter {
        reason: reason.into(),
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn parse_filter(&mut self) -> Result<Node, BuildError> {
        self.skip_whitespace();
        self.expect(b'(')?;

        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Node::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Node::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Node::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_term()?,
            None => return Err(malformed("unexpected end of expression")),
        };

        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Node>, BuildError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'(') => items.push(self.parse_filter()?),
                _ => break,
            }
        }
        if items.is_empty() {
            return Err(malformed("composite filter with no operands"));
        }
        Ok(items)
    }

    fn parse_term(&mut self) -> Result<Node, BuildError> {
        let attr_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'=' || c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        let attribute = std::str::from_utf8(&self.input[attr_start..self.pos])
            .map_err(|_| malformed("attribute is not valid UTF-8"))?
            .trim()
            .to_string();
        if attribute.is_empty() {
            return Err(malformed("empty attribute name"));
        }

        self.expect(b'=')?;

        let value_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        let value = std::str::from_utf8(&self.input[value_start..self.pos])
            .map_err(|_| malformed("value is not valid UTF-8"))?
            .to_string();

        let test = if value == "*" {
            ValueTest::Present
        } else if value.contains('*') {
            ValueTest::Wildcard(wildcard_regex(&value)?)
        } else {
            ValueTest::Exact(value)
        };

        Ok(Node::Term { attribute, test })
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<(), BuildError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(malformed(format!(
                "expected '{}' at byte {}",
                char::from(c),
                self.pos
            )))
        }
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, BuildError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut first = true;
    for part in pattern.split('*') {
        if !first {
            source.push_str(".*");
        }
        source.push_str(&regex::escape(part));
        first = false;
    }
    source.push('$');

    Regex::new(&source).map_err(|e| malformed(format!("wildcard pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_type_only() {
        let query = Query::build(None, Some("Foo")).unwrap();
        assert_eq!(query.expression(), "(objectClass=Foo)");
    }

    #[test]
    fn test_build_fragment_and_type_conjunction() {
        let query = Query::build(Some("(x=1)"), Some("Foo")).unwrap();
        assert_eq!(query.expression(), "(&(x=1)(objectClass=Foo))");
    }

    #[test]
    fn test_build_fragment_only() {
        let query = Query::build(Some("(x=1)"), None).unwrap();
        assert_eq!(query.expression(), "(x=1)");
    }

    #[test]
    fn test_build_neither_fails_fast() {
        let err = Query::build(None, None).unwrap_err();
        assert!(matches!(err, BuildError::EmptyQuery));
    }

    #[test]
    fn test_build_rejects_malformed_fragment() {
        let err = Query::build(Some("(x=1"), None).unwrap_err();
        assert!(matches!(err, BuildError::MalformedFilter { .. }));
    }

    #[test]
    fn test_match_type_and_property() {
        let cap = crate::Capability::new("Sensor").with("unit", "celsius");
        let filter = Query::build(Some("(unit=celsius)"), Some("Sensor"))
            .unwrap()
            .filter()
            .unwrap();
        assert!(filter.matches(&cap));

        let other = crate::Capability::new("Sensor").with("unit", "kelvin");
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_match_wildcard_value() {
        let filter = Filter::parse("(name=temp-*)").unwrap();
        assert!(filter.matches(&crate::Capability::new("X").with("name", "temp-3")));
        assert!(!filter.matches(&crate::Capability::new("X").with("name", "humidity-3")));
    }

    #[test]
    fn test_match_presence_and_negation() {
        let filter = Filter::parse("(&(unit=*)(!(unit=kelvin)))").unwrap();
        assert!(filter.matches(&crate::Capability::new("X").with("unit", "celsius")));
        assert!(!filter.matches(&crate::Capability::new("X").with("unit", "kelvin")));
        assert!(!filter.matches(&crate::Capability::new("X")));
    }

    #[test]
    fn test_match_disjunction() {
        let filter = Filter::parse("(|(unit=celsius)(unit=kelvin))").unwrap();
        assert!(filter.matches(&crate::Capability::new("X").with("unit", "kelvin")));
        assert!(!filter.matches(&crate::Capability::new("X").with("unit", "pascal")));
    }

    #[test]
    fn test_missing_property_never_matches() {
        let filter = Filter::parse("(unit=celsius)").unwrap();
        assert!(!filter.matches(&crate::Capability::new("X")));
    }
}

use crate::error::GatewayError;
use regex::Regex;

/// A piece of a path template: literal text or a `{name}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Split a template into literal runs and placeholders.
///
/// Rejects unbalanced braces, nested braces, empty names and names
/// containing `/`.
pub(crate) fn tokenize(template: &str) -> Result<Vec<Segment<'_>>, GatewayError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        if rest.as_bytes()[pos] == b'}' {
            return Err(GatewayError::Config(format!(
                "unmatched '}}' in template '{}'",
                template
            )));
        }
        if pos > 0 {
            segments.push(Segment::Literal(&rest[..pos]));
        }
        let after = &rest[pos + 1..];
        let close = after.find('}').ok_or_else(|| {
            GatewayError::Config(format!("unclosed '{{' in template '{}'", template))
        })?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') || name.contains('/') {
            return Err(GatewayError::Config(format!(
                "invalid placeholder '{{{}}}' in template '{}'",
                name, template
            )));
        }
        segments.push(Segment::Placeholder(name));
        rest = &after[close + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// One captured placeholder value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBinding {
    pub name: String,
    pub value: String,
}

impl TemplateBinding {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Successful match of a path against an upstream template.
///
/// `bindings` are ordered by appearance in the template; the replacer
/// consumes them positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMatch {
    pub bindings: Vec<TemplateBinding>,
    pub matched: String,
}

/// Compiled upstream path template.
///
/// Every `{name}` becomes a greedy wildcard group. The pattern is anchored
/// at both ends, so a template without a trailing slash matches to the end
/// of the path and a trailing slash is required when the template has one.
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    template: String,
    pattern: String,
    regex: Regex,
    placeholders: Vec<String>,
}

impl UrlTemplate {
    pub fn compile(template: &str) -> Result<Self, GatewayError> {
        let segments = tokenize(template)?;

        let mut pattern = String::with_capacity(template.len() + 8);
        let mut source = String::with_capacity(template.len() + 16);
        let mut placeholders = Vec::new();
        source.push('^');

        for segment in &segments {
            match segment {
                Segment::Literal(text) => {
                    pattern.push_str(text);
                    source.push_str(&regex::escape(text));
                }
                Segment::Placeholder(name) => {
                    pattern.push_str(".*");
                    source.push_str("(.*)");
                    placeholders.push((*name).to_string());
                }
            }
        }
        pattern.push('$');
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| {
            GatewayError::Config(format!("template '{}' does not compile: {}", template, e))
        })?;

        Ok(Self {
            template: template.to_string(),
            pattern,
            regex,
            placeholders,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Human-readable match pattern, e.g. `/api/products/.*$`.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn match_path(&self, path: &str) -> Option<UrlMatch> {
        let caps = self.regex.captures(path)?;
        let bindings = self
            .placeholders
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = caps.get(i + 1).map(|m| m.as_str()).unwrap_or_default();
                TemplateBinding::new(name.as_str(), value)
            })
            .collect();
        let matched = caps.get(0).map(|m| m.as_str()).unwrap_or_default().to_string();
        Some(UrlMatch { bindings, matched })
    }
}

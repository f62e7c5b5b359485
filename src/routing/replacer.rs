use super::template::{tokenize, Segment, UrlMatch};
use crate::error::GatewayError;

/// Build the downstream path by substituting bindings into `template`.
///
/// Placeholders are filled positionally: the n-th `{..}` token receives the
/// n-th binding, whatever its name. Literal text is copied verbatim. A
/// placeholder with no binding left to consume is an error.
pub fn replace_template_variables(
    template: &str,
    url_match: &UrlMatch,
) -> Result<String, GatewayError> {
    if template.is_empty() && url_match.bindings.is_empty() {
        return Ok(String::new());
    }

    let segments = tokenize(template)?;
    let mut bindings = url_match.bindings.iter();
    let mut out = String::with_capacity(template.len() + url_match.matched.len());

    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let binding = bindings.next().ok_or_else(|| {
                    GatewayError::Internal(format!(
                        "downstream template '{}' has more placeholders than the upstream match, missing '{{{}}}'",
                        template, name
                    ))
                })?;
                out.push_str(&binding.value);
            }
        }
    }
    Ok(out)
}

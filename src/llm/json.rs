//! Tolerant JSON extraction from model output.

/// Extract a JSON object from model output.
///
/// Handles bare objects, markdown code fences, and objects embedded in
/// surrounding prose. Returns the trimmed input when no braces are found.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Parse the first JSON object found in `text`.
pub fn parse_json_object<T: serde::de::DeserializeOwned>(
    text: &str,
) -> Result<T, serde_json::Error> {
    serde_json::from_str(&extract_json_object(text))
}

use crate::errors::{AppError, AppResult};
use std::collections::BTreeMap;
use std::path::Path;

fn unquote(raw: &str) -> String {
    let value = raw.trim();
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'"' && last == b'"' {
            return value[1..value.len() - 1]
                .replace("\\n", "\n")
                .replace("\\r", "\r")
                .replace("\\\"", "\"");
        }
        if (first == b'\'' && last == b'\'') || (first == b'`' && last == b'`') {
            return value[1..value.len() - 1].to_string();
        }
    }
    // Unquoted values may carry a trailing ` # comment`.
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Parses `KEY=value` lines. Blank values are dropped so they never reach a remote store.
pub fn parse_dotenv(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-') {
            continue;
        }
        let value = unquote(value);
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        entries.insert(key.to_string(), value.to_string());
    }
    entries
}

pub fn load_env_file(path: &Path) -> AppResult<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .map_err(|error| AppError::Io(format!("failed to read env file {}: {}", path.display(), error)))?;
    Ok(parse_dotenv(&text))
}

#[cfg(test)]
mod tests {
    use super::parse_dotenv;

    #[test]
    fn parses_quotes_comments_and_exports() {
        let text = r#"
# database
export DATABASE_URL="postgres://u:p@db/app"
API_KEY='abc # not a comment'
PLAIN=value # trailing comment
MULTI="line1\nline2"
EMPTY=
SPACES=
  INDENTED = yes
not a pair
"#;
        let parsed = parse_dotenv(text);
        assert_eq!(parsed.get("DATABASE_URL").map(String::as_str), Some("postgres://u:p@db/app"));
        assert_eq!(parsed.get("API_KEY").map(String::as_str), Some("abc # not a comment"));
        assert_eq!(parsed.get("PLAIN").map(String::as_str), Some("value"));
        assert_eq!(parsed.get("MULTI").map(String::as_str), Some("line1\nline2"));
        assert_eq!(parsed.get("INDENTED").map(String::as_str), Some("yes"));
        assert!(!parsed.contains_key("EMPTY"));
        assert!(!parsed.contains_key("SPACES"));
        assert_eq!(parsed.len(), 5);
    }

    #[test]
    fn later_assignment_wins() {
        let parsed = parse_dotenv("A=1\nA=2\n");
        assert_eq!(parsed.get("A").map(String::as_str), Some("2"));
    }
}

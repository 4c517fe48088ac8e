/// Read an environment variable and parse it, treating empty values as
/// absent. A present-but-unparseable value is reported so misconfiguration
/// never silently falls back to a default.
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name}: cannot parse {raw:?}")),
        Err(_) => Ok(None),
    }
}

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_bool(name: &str) -> Option<bool> {
    env_string(name).and_then(|raw| parse_bool(&raw))
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn backend_url_override() -> Option<String> {
    env_string("MAL_BACKEND_URL")
}

pub fn websocket_url_override() -> Option<String> {
    env_string("MAL_WS_URL")
}

pub fn ui_catalog_path_override() -> Option<String> {
    env_string("MAL_UI_CATALOG_PATH")
}

pub fn verbose_logging() -> bool {
    parse_env_bool("MAL_VERBOSE").unwrap_or(false)
}

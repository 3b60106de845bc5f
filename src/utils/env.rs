/// Get environment variable with HIREBOARD_ prefix, falling back to unprefixed version
///
/// This helper function checks for `HIREBOARD_{key}` first, then falls back to `{key}`
/// for compatibility with standard environment variable naming.
///
/// # Examples
///
/// ```rust,ignore
/// use hireboard::utils::get_env_with_prefix;
///
/// // Checks HIREBOARD_LOG_LEVEL first, then LOG_LEVEL
/// let level = get_env_with_prefix("LOG_LEVEL");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("HIREBOARD_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse an environment variable with [`get_env_with_prefix`], ignoring values
/// that fail to parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|v| v.trim().parse().ok())
}

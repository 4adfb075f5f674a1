//! Environment parsing helpers shared by every config section.

pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|raw| {
        raw.split(',')
            .filter_map(|part| {
                let trimmed = part.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect()
    })
}

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| parse_bool(&raw))
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    env_string(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

pub fn env_u32(name: &str, default: u32) -> u32 {
    env_string(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

pub fn env_usize(name: &str, default: usize) -> usize {
    env_string(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

pub fn env_f64(name: &str, default: f64) -> f64 {
    env_string(name)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

pub fn env_bool(name: &str, default: bool) -> bool {
    parse_bool_var(name).unwrap_or(default)
}

pub fn env_csv(name: &str, default: &[&str]) -> Vec<String> {
    parse_csv_var(name)
        .unwrap_or_else(|| default.iter().map(|item| item.to_string()).collect())
}

/// Parse `key=value` pairs from a CSV env var, e.g. `vector=20,analytic=40`.
pub fn env_kv_f64(name: &str, defaults: &[(&str, f64)]) -> Vec<(String, f64)> {
    let mut pairs: Vec<(String, f64)> = defaults
        .iter()
        .map(|(key, value)| (key.to_string(), *value))
        .collect();
    let Some(entries) = parse_csv_var(name) else {
        return pairs;
    };
    for entry in entries {
        let Some((key, raw_value)) = entry.split_once('=') else {
            continue;
        };
        let Ok(value) = raw_value.trim().parse::<f64>() else {
            continue;
        };
        let key = key.trim().to_string();
        if let Some(existing) = pairs.iter_mut().find(|(name, _)| *name == key) {
            existing.1 = value;
        } else {
            pairs.push((key, value));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_env_forms() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nope"), None);
    }

    #[test]
    fn kv_parser_overrides_defaults_and_keeps_unknown_keys() {
        unsafe {
            std::env::set_var("LATTICE_TEST_KV", "vector=99, custom=1.5, junk");
        }
        let pairs = env_kv_f64("LATTICE_TEST_KV", &[("vector", 20.0), ("analytic", 40.0)]);
        assert!(pairs.contains(&("vector".to_string(), 99.0)));
        assert!(pairs.contains(&("analytic".to_string(), 40.0)));
        assert!(pairs.contains(&("custom".to_string(), 1.5)));
        unsafe {
            std::env::remove_var("LATTICE_TEST_KV");
        }
    }
}

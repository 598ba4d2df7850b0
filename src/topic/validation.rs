//! MQTT topic name and filter rules
//!
//! The bridge subscribes with the topic derived from the request path,
//! which may be a filter, and publishes with the topic taken from each
//! socket frame, which must be a plain topic name.

/// Longest topic the MQTT wire format can carry
pub const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name (used when publishing)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used when subscribing)
///
/// `#` must be a whole level and the last one; `+` must be a whole level.
/// `$share/{group}/{filter}` is accepted when group and filter are non-empty.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let filter = match filter.strip_prefix("$share/") {
        Some(rest) => match rest.split_once('/') {
            Some((group, actual)) if !group.is_empty() && !actual.is_empty() => {
                if group.contains(['+', '#']) {
                    return Err("shared subscription group cannot contain wildcards");
                }
                actual
            }
            _ => return Err("invalid shared subscription format"),
        },
        None => filter,
    };

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the entire last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

fn check_common(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Check if a topic name matches a topic filter
///
/// Topics starting with `$` never match filters starting with a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("sensors/1").is_ok());
        assert!(validate_topic_name("/leading/slash").is_ok());
        assert!(validate_topic_name("room 1").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("nul\0byte").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("sensors/1").is_ok());
        assert!(validate_topic_filter("sensors/+").is_ok());
        assert!(validate_topic_filter("sensors/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("$share/g/sensors/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("sensors/#/more").is_err());
        assert!(validate_topic_filter("sensors#").is_err());
        assert!(validate_topic_filter("sens+rs").is_err());
        assert!(validate_topic_filter("$share//x").is_err());
        assert!(validate_topic_filter("$share/g").is_err());
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("sensors/1", "sensors/1"));
        assert!(topic_matches_filter("sensors/1", "sensors/+"));
        assert!(topic_matches_filter("sensors/1/temp", "sensors/#"));
        assert!(topic_matches_filter("sensors", "sensors/#"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));

        assert!(!topic_matches_filter("sensors/1", "sensors/2"));
        assert!(!topic_matches_filter("sensors/1/temp", "sensors/+"));
        assert!(!topic_matches_filter("sensors", "sensors/+"));
        assert!(!topic_matches_filter("a", "b"));
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/+"));
    }
}

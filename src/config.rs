//! Typed projection of the recognised framework configuration keys (spec
//! §6). Parsing an actual config file is out of scope (bootstrapping is an
//! external collaborator); this struct's job is to turn an already-parsed
//! `HashMap<String, String>` into typed fields, passing unrecognised keys
//! through unchanged for modules to consume.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FrameworkProperties {
    pub event_thread_pool_size: usize,
    pub modules_reload_poll_interval: Duration,
    pub modules_auto_reload: bool,
    pub modules_auto_start: bool,
    pub security_enabled: bool,
    pub ipc_enabled: bool,
    pub service_cache_size: usize,
    pub log_level: String,
    /// Keys this crate doesn't recognise, preserved verbatim for modules.
    pub passthrough: HashMap<String, String>,
}

impl Default for FrameworkProperties {
    fn default() -> Self {
        Self {
            event_thread_pool_size: 8,
            modules_reload_poll_interval: Duration::from_millis(1000),
            modules_auto_reload: false,
            modules_auto_start: true,
            security_enabled: false,
            ipc_enabled: false,
            service_cache_size: 128,
            log_level: "info".to_string(),
            passthrough: HashMap::new(),
        }
    }
}

impl FrameworkProperties {
    pub fn from_map(mut map: HashMap<String, String>) -> Self {
        let mut props = Self::default();

        if let Some(v) = map.remove("framework.event.thread.pool.size") {
            if let Ok(n) = v.parse() {
                props.event_thread_pool_size = n;
            }
        }
        if let Some(v) = map.remove("framework.modules.reload.poll.interval") {
            if let Ok(ms) = v.parse() {
                props.modules_reload_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Some(v) = map.remove("framework.modules.auto.reload") {
            props.modules_auto_reload = v == "true";
        }
        if let Some(v) = map.remove("framework.modules.auto.start") {
            props.modules_auto_start = v == "true";
        }
        if let Some(v) = map.remove("framework.security.enabled") {
            props.security_enabled = v == "true";
        }
        if let Some(v) = map.remove("framework.ipc.enabled") {
            props.ipc_enabled = v == "true";
        }
        if let Some(v) = map.remove("framework.service.cache.size") {
            if let Ok(n) = v.parse() {
                props.service_cache_size = n;
            }
        }
        if let Some(v) = map.remove("framework.log.level") {
            props.log_level = v;
        }

        props.passthrough = map;
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let props = FrameworkProperties::default();
        assert_eq!(props.event_thread_pool_size, 8);
        assert_eq!(props.modules_reload_poll_interval, Duration::from_millis(1000));
        assert!(!props.modules_auto_reload);
        assert!(props.modules_auto_start);
    }

    #[test]
    fn unrecognised_keys_pass_through() {
        let mut map = HashMap::new();
        map.insert("framework.modules.auto.start".to_string(), "false".to_string());
        map.insert("my.module.custom.key".to_string(), "42".to_string());
        let props = FrameworkProperties::from_map(map);
        assert!(!props.modules_auto_start);
        assert_eq!(props.passthrough.get("my.module.custom.key"), Some(&"42".to_string()));
    }
}

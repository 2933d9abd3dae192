use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

/// Active user-space tag bitmask, read by the application tracing API.
pub const KEY_USER_TAGS: &str = "debug.tracedump.tags.enableflags";
/// Optional PID filter for application tracing.
pub const KEY_APP_PID: &str = "debug.tracedump.app_pid";

lazy_static! {
    static ref PROPERTIES: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

pub fn set_property(key: &str, value: &str) -> bool {
    match PROPERTIES.lock() {
        Ok(mut map) => {
            map.insert(key.to_string(), value.to_string());
            log::info!("set {} = {}", key, value);
            true
        }
        Err(_) => {
            log::error!("set {} failed", key);
            false
        }
    }
}

pub fn get_property(key: &str, default: &str) -> String {
    PROPERTIES
        .lock()
        .ok()
        .and_then(|map| map.get(key).cloned())
        .unwrap_or_else(|| default.to_string())
}

pub fn get_property_u64(key: &str, default: u64) -> u64 {
    get_property(key, "")
        .parse::<u64>()
        .unwrap_or(default)
}

#[cfg(test)]
lazy_static! {
    static ref TEST_GUARD: Mutex<()> = Mutex::new(());
}

/// Tests touching process-wide property state serialize on this guard.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

use std::time::Duration;

/// Core-relevant configuration. Keep it simple: read from env with explicit
/// defaults; the outer process may layer a real config system on top.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Spec versions retained per run spec before GC may prune.
    pub max_versions: usize,
    /// Root group versions retained before GC may prune.
    pub max_root_versions: usize,
    /// Interval between automatic GC runs. `None` disables the timer; GC then
    /// only runs on demand.
    pub gc_scan_interval: Option<Duration>,
    /// Maximum concurrently in-flight kill requests.
    pub kill_chunk_size: usize,
    /// Re-issue a kill when a task has not turned terminal after this long.
    pub kill_retry_timeout: Duration,
    /// Role used for run specs that declare none and sit under no enforcing
    /// group.
    pub default_role: String,
    /// Name this control plane registers with at the offer layer.
    pub framework_name: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_versions: 50,
            max_root_versions: 50,
            gc_scan_interval: None,
            kill_chunk_size: 5,
            kill_retry_timeout: Duration::from_secs(600),
            default_role: "*".into(),
            framework_name: "regatta".into(),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let defaults = CoreConfig::default();

        let max_versions = env_parse("REGATTA_MAX_VERSIONS", defaults.max_versions);
        let max_root_versions = env_parse("REGATTA_MAX_ROOT_VERSIONS", defaults.max_root_versions);
        let gc_scan_interval = match env_parse("REGATTA_GC_SCAN_INTERVAL_SECS", 0u64) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let kill_chunk_size = env_parse("REGATTA_KILL_CHUNK_SIZE", defaults.kill_chunk_size);
        let kill_retry_timeout = Duration::from_secs(env_parse(
            "REGATTA_KILL_RETRY_TIMEOUT_SECS",
            defaults.kill_retry_timeout.as_secs(),
        ));
        let default_role =
            std::env::var("REGATTA_DEFAULT_ROLE").unwrap_or(defaults.default_role);
        let framework_name =
            std::env::var("REGATTA_FRAMEWORK_NAME").unwrap_or(defaults.framework_name);

        CoreConfig {
            max_versions,
            max_root_versions,
            gc_scan_interval,
            kill_chunk_size,
            kill_retry_timeout,
            default_role,
            framework_name,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

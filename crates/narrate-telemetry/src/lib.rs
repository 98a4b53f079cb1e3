use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "narrate_store" => WARN).
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from loosely-typed level names. Unknown names fall back to the
    /// default level (or are skipped, for module overrides) with a note on stderr.
    pub fn from_names<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        let log_level = parse_level(level).unwrap_or_else(|| {
            eprintln!("narrate-telemetry: unknown log level {level:?}, using info");
            Level::INFO
        });
        let module_levels = modules
            .into_iter()
            .filter_map(|(module, name)| match parse_level(name) {
                Some(lvl) => Some((module.to_string(), lvl)),
                None => {
                    eprintln!("narrate-telemetry: ignoring level {name:?} for {module}");
                    None
                }
            })
            .collect();
        Self {
            log_level,
            module_levels,
            json,
        }
    }

    /// Directive string equivalent to this config, e.g. `info,narrate_store=warn`.
    pub fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Case-insensitive level name (`trace` … `error`).
pub fn parse_level(name: &str) -> Option<Level> {
    Level::from_str(name.trim()).ok()
}

/// Returned by [`init_telemetry`]; keep it alive for the life of the process.
#[derive(Debug)]
pub struct TelemetryGuard {
    filter: String,
    installed: bool,
}

impl TelemetryGuard {
    /// The filter actually in effect (RUST_LOG when set).
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// False when another global subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the tracing subscriber. Call once at startup. Output goes to
/// stderr so command output on stdout stays machine-readable.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(f) => {
            let s = f.to_string();
            (f, s)
        }
        Err(_) => {
            let s = config.directives();
            (EnvFilter::new(&s), s)
        }
    };

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let pretty_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .is_ok();

    TelemetryGuard { filter, installed }
}

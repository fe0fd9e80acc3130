//! Initialisation du système de logging
//!
//! Un registre `tracing-subscriber` composé de :
//! - un filtre de niveau rechargeable (modifiable à chaud via [`LogHandle`]) ;
//! - un `EnvFilter` lorsque `RUST_LOG` est défini, qui prend alors la main ;
//! - une sortie console optionnelle.

use anyhow::{Result, anyhow};
use pmoconfig::Config;
use std::sync::{Arc, RwLock};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, layer::SubscriberExt, reload,
    util::SubscriberInitExt,
};

/// Options d'initialisation du système de logging
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Niveau minimum (`ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE`)
    pub min_level: String,
    /// Activer la sortie vers la console
    pub enable_console: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            min_level: "INFO".to_string(),
            enable_console: true,
        }
    }
}

impl LoggingOptions {
    /// Lit les options dans la section `host.logger` de la configuration
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            min_level: config.get_log_min_level().unwrap_or(defaults.min_level),
            enable_console: config
                .get_log_enable_console()
                .unwrap_or(defaults.enable_console),
        }
    }
}

/// Poignée sur le filtre de niveau installé
#[derive(Clone)]
pub struct LogHandle {
    max_level: Arc<RwLock<Level>>,
    reload_handle: reload::Handle<LevelFilter, Registry>,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("max_level", &self.max_level())
            .finish()
    }
}

impl LogHandle {
    /// Change le niveau maximum à chaud
    pub fn set_max_level(&self, level: Level) -> Result<()> {
        self.reload_handle
            .reload(level_to_levelfilter(level))
            .map_err(|e| anyhow!("failed to reload log level filter: {}", e))?;
        *self.max_level.write().unwrap_or_else(|e| e.into_inner()) = level;
        Ok(())
    }

    pub fn max_level(&self) -> Level {
        *self.max_level.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Initialise le subscriber global
///
/// # Errors
///
/// Échoue si un subscriber global est déjà installé.
///
/// # Exemple
///
/// ```rust,no_run
/// use pmoserver::logs::{init_logging, LoggingOptions};
///
/// let handle = init_logging(LoggingOptions {
///     min_level: "DEBUG".into(),
///     enable_console: true,
/// })?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init_logging(options: LoggingOptions) -> Result<LogHandle> {
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|_| EnvFilter::try_from_default_env().ok());

    // RUST_LOG décide seul lorsqu'il est présent
    let level = match env_filter {
        Some(_) => Level::TRACE,
        None => string_to_level(&options.min_level).unwrap_or(Level::INFO),
    };

    let (filter, reload_handle) = reload::Layer::new(level_to_levelfilter(level));

    let console = options.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
    });

    Registry::default()
        .with(filter)
        .with(env_filter)
        .with(console)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

    Ok(LogHandle {
        max_level: Arc::new(RwLock::new(level)),
        reload_handle,
    })
}

/// Convertit un nom de niveau, insensible à la casse
pub fn string_to_level(s: &str) -> Option<Level> {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

pub fn level_to_string(level: Level) -> String {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
    .to_string()
}

fn level_to_levelfilter(level: Level) -> LevelFilter {
    match level {
        Level::ERROR => LevelFilter::ERROR,
        Level::WARN => LevelFilter::WARN,
        Level::INFO => LevelFilter::INFO,
        Level::DEBUG => LevelFilter::DEBUG,
        Level::TRACE => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_level() {
        assert_eq!(string_to_level("info"), Some(Level::INFO));
        assert_eq!(string_to_level(" Warning "), Some(Level::WARN));
        assert_eq!(string_to_level("verbose"), None);
        assert_eq!(level_to_string(Level::DEBUG), "DEBUG");
    }

    #[test]
    fn test_options_from_config() {
        let config = Config::embedded();
        config.set_log_min_level("debug".into()).unwrap();
        config.set_log_enable_console(false).unwrap();

        let options = LoggingOptions::from_config(&config);
        assert_eq!(options.min_level, "debug");
        assert!(!options.enable_console);
    }
}

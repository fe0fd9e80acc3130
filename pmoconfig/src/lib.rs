//! # PMOWebp Configuration Module
//!
//! This module provides configuration management for PMOWebp, including:
//! - Loading configuration from YAML files
//! - Merging with embedded default configuration
//! - Environment variable overrides
//! - Type-safe getters and setters for configuration values
//! - Thread-safe singleton access pattern
//!
//! Domain-specific settings (images, proxy, lazy conversion) are read by
//! extension traits living in the crates that use them, on top of the
//! generic accessors exposed here.
//!
//! ## Usage
//!
//! ```no_run
//! use pmoconfig::get_config;
//!
//! // Get the global configuration
//! let config = get_config();
//!
//! // Access configuration values
//! let port = config.get_http_port();
//! let quality = config.get_usize(&["images", "quality"], 80);
//!
//! // Update configuration values
//! config.set_http_port(9000)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use dirs::home_dir;
use lazy_static::lazy_static;
use serde_yaml::{Mapping, Number, Value};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::info;

// Embedded default configuration
const DEFAULT_CONFIG: &str = include_str!("pmowebp.yaml");

lazy_static! {
    static ref CONFIG: Arc<Config> = Arc::new(match Config::load_config("") {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load PMOWebp configuration: {}, using embedded defaults", e);
            Config::embedded()
        }
    });
}

const ENV_CONFIG_DIR: &str = "PMOWEBP_CONFIG";
const ENV_PREFIX: &str = "PMOWEBP_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmowebp";

// Default values for configuration
const DEFAULT_LISTEN: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 3333;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> Result<bool> {
            match self.get_value($path)? {
                Value::Bool(b) => Ok(b),
                _ => Ok($default),
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Configuration manager for PMOWebp
///
/// This structure manages the application configuration, including:
/// - Loading configuration from YAML files
/// - Merging with default configuration
/// - Handling environment variable overrides
/// - Providing typed getters/setters for configuration values
///
/// # Examples
///
/// ```no_run
/// use pmoconfig::get_config;
///
/// let config = get_config();
/// let port = config.get_http_port();
/// println!("HTTP port: {}", port);
/// ```
#[derive(Debug)]
pub struct Config {
    config_dir: String,
    path: String,
    data: Mutex<Value>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        let data = self.lock().clone();
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(data),
        }
    }
}

impl Config {
    /// Finds a config directory by trying different locations in order
    fn find_config_dir(directory: &str) -> String {
        // 1. Try provided directory
        if !directory.is_empty() {
            return directory.to_string();
        }

        // 2. Try environment variable
        if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
            info!(env_var=ENV_CONFIG_DIR, path=%env_path, "Trying to load config from env");
            return env_path;
        }

        // 3. Try current directory
        if Path::new(CONFIG_DIR_NAME).exists() {
            return CONFIG_DIR_NAME.to_string();
        }

        // 4. Try home directory
        if let Some(home) = home_dir() {
            let home_config = home.join(CONFIG_DIR_NAME);
            if home_config.exists() {
                return home_config.to_string_lossy().to_string();
            }
        }

        // Default fallback
        CONFIG_DIR_NAME.to_string()
    }

    /// Validates and prepares a config directory
    fn validate_config_dir(path: &Path) -> Result<()> {
        // Create if doesn't exist
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        // Test write permission
        let test_file = path.join(".write_test");
        fs::write(&test_file, b"test")?;
        fs::remove_file(&test_file)?;

        // Test read permission
        fs::read_dir(path)?;

        Ok(())
    }

    /// Determines and validates the configuration directory
    ///
    /// The directory is searched in the following order:
    /// 1. The provided `directory` parameter if not empty
    /// 2. The `PMOWEBP_CONFIG` environment variable
    /// 3. `.pmowebp` in the current directory
    /// 4. `.pmowebp` in the user's home directory
    ///
    /// The directory is created if it doesn't exist, and validated for read/write permissions.
    pub fn config_dir(directory: &str) -> Result<String> {
        let dir_path = Self::find_config_dir(directory);
        Self::validate_config_dir(Path::new(&dir_path))?;
        Ok(dir_path)
    }

    /// Loads the configuration from the specified directory
    ///
    /// This method:
    /// 1. Determines the configuration directory
    /// 2. Loads the default embedded configuration
    /// 3. Merges it with the external config.yaml file if present
    /// 4. Applies environment variable overrides
    /// 5. Saves the merged configuration
    ///
    /// # Arguments
    ///
    /// * `directory` - The directory containing the config.yaml file, or empty to use defaults
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::config_dir(directory)?;
        info!(config_dir=%config_dir, "Using config directory");

        let config_file_path = Path::new(&config_dir).join("config.yaml");
        let path = config_file_path.to_string_lossy().to_string();

        let mut default_value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        let yaml_data = if let Ok(data) = fs::read(&path) {
            info!(config_file=%path, "Loaded config file");
            data
        } else {
            info!(config_file=%path, "Config file not found, using default embedded config");
            DEFAULT_CONFIG.as_bytes().to_vec()
        };

        // An empty file parses as null and leaves the defaults untouched
        let external_value: Value = serde_yaml::from_slice(&yaml_data)?;
        if !external_value.is_null() {
            merge_yaml(&mut default_value, &external_value);
        }
        let mut config_value = Self::lower_keys_value(default_value);

        Self::apply_env_overrides(&mut config_value);

        let config = Config {
            config_dir,
            path,
            data: Mutex::new(config_value),
        };

        config.save()?;
        Ok(config)
    }

    /// Builds an in-memory configuration from the embedded defaults only
    ///
    /// Nothing is written to disk: `save` is a no-op without a file path.
    pub fn embedded() -> Self {
        let value = serde_yaml::from_str(DEFAULT_CONFIG).unwrap_or(Value::Mapping(Mapping::new()));
        Config {
            config_dir: ".".to_string(),
            path: String::new(),
            data: Mutex::new(Self::lower_keys_value(value)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Directory holding config.yaml; relative paths are resolved against it
    pub fn get_config_dir(&self) -> &str {
        &self.config_dir
    }

    /// Saves the current configuration to the config.yaml file
    pub fn save(&self) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }
        let yaml = serde_yaml::to_string(&*self.lock())?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["host", "http_port"]`)
    /// * `value` - The YAML value to set
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        let mut data = self.lock();
        Self::set_value_internal(&mut data, path, value)?;
        drop(data);
        self.save()?;
        Ok(())
    }

    fn set_value_internal(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
        if path.is_empty() {
            *data = value;
            return Ok(());
        }
        if let Value::Mapping(map) = data {
            let key = path[0].to_lowercase();
            let key_value = Value::String(key);
            if path.len() == 1 {
                map.insert(key_value, value);
            } else {
                let entry = map
                    .entry(key_value)
                    .or_insert(Value::Mapping(Mapping::new()));
                Self::set_value_internal(entry, &path[1..], value)?;
            }
            Ok(())
        } else {
            Err(anyhow!("Current node is not a map"))
        }
    }

    /// Gets a configuration value at the specified path
    ///
    /// # Arguments
    ///
    /// * `path` - Array of keys representing the path (e.g., `&["host", "http_port"]`)
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing the YAML value or an error if the path doesn't exist
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.lock();
        Self::get_value_internal(&data, path)
    }

    fn get_value_internal(data: &Value, path: &[&str]) -> Result<Value> {
        let mut current = data;
        for (i, key) in path.iter().enumerate() {
            if let Value::Mapping(map) = current {
                let key = key.to_lowercase();

                if let Some(next) = map.get(Value::String(key)) {
                    current = next;
                } else {
                    return Err(anyhow!("Path {} does not exist", path[..=i].join(".")));
                }
            } else {
                return Err(anyhow!("Path {} is not a Config", path[..i].join(".")));
            }
        }
        Ok(current.clone())
    }

    fn apply_env_overrides(config: &mut Value) {
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let key_path = stripped.split("__").collect::<Vec<_>>();
                let yaml_value = Self::convert_env_value(&value);
                let _ = Self::set_value_internal(config, &key_path, yaml_value);
            }
        }
    }

    fn convert_env_value(value: &str) -> Value {
        if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
            return parsed;
        }
        Value::String(value.to_string())
    }

    fn lower_keys_value(value: Value) -> Value {
        match value {
            Value::Mapping(map) => {
                let mut new_map = Mapping::new();
                for (k, v) in map {
                    if let Value::String(s) = k {
                        let new_key = Value::String(s.to_lowercase());
                        let new_val = Self::lower_keys_value(v);
                        new_map.insert(new_key, new_val);
                    } else {
                        new_map.insert(k, Self::lower_keys_value(v));
                    }
                }
                Value::Mapping(new_map)
            }
            Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Self::lower_keys_value).collect())
            }
            _ => value,
        }
    }

    /// Resolves a path against the configuration directory when it is relative
    pub fn resolve_path(&self, dir_path: &str) -> PathBuf {
        let path = Path::new(dir_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.config_dir).join(path)
        }
    }

    /// Résout un chemin relatif ou absolu et crée le répertoire si nécessaire
    fn resolve_and_create_dir(&self, dir_path: &str) -> Result<String> {
        let absolute_path = self.resolve_path(dir_path);

        if !absolute_path.exists() {
            fs::create_dir_all(&absolute_path)?;
            info!(directory=%absolute_path.display(), "Created managed directory");
        }

        Ok(absolute_path.to_string_lossy().to_string())
    }

    /// Récupère un répertoire géré par la configuration
    ///
    /// The directory may be absolute or relative to the configuration
    /// directory. It is created if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `path` - Path in the configuration tree (e.g. `&["images", "exhaust_path"]`)
    /// * `default` - Directory used (and stored) when the key is missing
    ///
    /// # Exemple
    ///
    /// ```no_run
    /// use pmoconfig::get_config;
    ///
    /// let config = get_config();
    /// let exhaust = config.get_managed_dir(&["images", "exhaust_path"], "exhaust")?;
    /// println!("Exhaust directory: {}", exhaust);
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn get_managed_dir(&self, path: &[&str], default: &str) -> Result<String> {
        let dir_path = match self.get_value(path) {
            Ok(Value::String(s)) => s,
            _ => {
                self.set_managed_dir(path, default.to_string())?;
                default.to_string()
            }
        };
        self.resolve_and_create_dir(&dir_path)
    }

    /// Définit un répertoire géré par la configuration
    pub fn set_managed_dir(&self, path: &[&str], directory: String) -> Result<()> {
        self.set_value(path, Value::String(directory))
    }

    /// Reads a string, falling back to `default` when missing or not a scalar
    pub fn get_string(&self, path: &[&str], default: &str) -> String {
        match self.get_value(path) {
            Ok(Value::String(s)) => s,
            Ok(Value::Number(n)) => n.to_string(),
            Ok(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    /// Reads a non-negative integer, falling back to `default`
    pub fn get_usize(&self, path: &[&str], default: usize) -> usize {
        match self.get_value(path) {
            Ok(Value::Number(n)) => n.as_u64().map(|n| n as usize).unwrap_or(default),
            Ok(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Sets an integer value
    pub fn set_usize(&self, path: &[&str], value: usize) -> Result<()> {
        self.set_value(path, Value::Number(Number::from(value as u64)))
    }

    /// Reads a boolean, falling back to `default`
    pub fn get_bool(&self, path: &[&str], default: bool) -> bool {
        match self.get_value(path) {
            Ok(Value::Bool(b)) => b,
            Ok(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// Reads a list of strings; a single scalar is read as a one-element list
    pub fn get_string_list(&self, path: &[&str], default: &[&str]) -> Vec<String> {
        let scalar = |v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        match self.get_value(path) {
            Ok(Value::Sequence(seq)) => seq.iter().filter_map(scalar).collect(),
            Ok(v) => match scalar(&v) {
                Some(s) => vec![s],
                None => default.iter().map(|s| s.to_string()).collect(),
            },
            Err(_) => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Reads a mapping of strings to strings
    ///
    /// Nested mappings are flattened through `inner_key` when present
    /// (`host: { backend_url: ... }` reads as `host: ...`).
    pub fn get_string_map(&self, path: &[&str], inner_key: &str) -> HashMap<String, String> {
        let mut result = HashMap::new();
        if let Ok(Value::Mapping(map)) = self.get_value(path) {
            for (k, v) in map {
                let Value::String(key) = k else { continue };
                let value = match v {
                    Value::String(s) => s,
                    Value::Mapping(inner) => match inner.get(Value::String(inner_key.to_string())) {
                        Some(Value::String(s)) => s.clone(),
                        _ => continue,
                    },
                    _ => continue,
                };
                result.insert(key, value);
            }
        }
        result
    }

    /// Gets the listen address of the HTTP server
    pub fn get_listen(&self) -> String {
        self.get_string(&["host", "listen"], DEFAULT_LISTEN)
    }

    /// Gets the HTTP port from configuration
    ///
    /// Returns the configured HTTP port, or the default port (3333) if not configured or invalid.
    pub fn get_http_port(&self) -> u16 {
        match self.get_value(&["host", "http_port"]) {
            Ok(Value::Number(n)) => match n.as_u64().and_then(|p| u16::try_from(p).ok()) {
                Some(port) => port,
                None => {
                    tracing::warn!("Invalid HTTP port {}, using default {}", n, DEFAULT_HTTP_PORT);
                    DEFAULT_HTTP_PORT
                }
            },
            Ok(Value::String(s)) => match s.parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    tracing::warn!(
                        "Invalid HTTP port '{}', using default {}",
                        s,
                        DEFAULT_HTTP_PORT
                    );
                    DEFAULT_HTTP_PORT
                }
            },
            Ok(_) => {
                tracing::warn!(
                    "HTTP port not a number or string, using default {}",
                    DEFAULT_HTTP_PORT
                );
                DEFAULT_HTTP_PORT
            }
            Err(err) => {
                tracing::warn!(
                    "Failed to get HTTP port: {}, using default {}",
                    err,
                    DEFAULT_HTTP_PORT
                );
                DEFAULT_HTTP_PORT
            }
        }
    }

    /// Sets the HTTP port in configuration
    pub fn set_http_port(&self, port: u16) -> Result<()> {
        let n = Number::from(port);
        self.set_value(&["host", "http_port"], Value::Number(n))
    }

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["host", "logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );

    /// Récupère le niveau de log minimum depuis la configuration
    pub fn get_log_min_level(&self) -> Result<String> {
        match self.get_value(&["host", "logger", "min_level"])? {
            Value::String(s) => Ok(s),
            _ => Ok(DEFAULT_LOG_MIN_LEVEL.to_string()),
        }
    }

    /// Définit le niveau de log minimum dans la configuration
    pub fn set_log_min_level(&self, level: String) -> Result<()> {
        self.set_value(&["host", "logger", "min_level"], Value::String(level))
    }
}

/// Returns the global configuration instance
///
/// This function provides access to the singleton configuration instance,
/// which is lazily loaded on first access.
///
/// # Examples
///
/// ```no_run
/// use pmoconfig::get_config;
///
/// let config = get_config();
/// let port = config.get_http_port();
/// ```
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

/// Merges external YAML configuration into default configuration
///
/// This function recursively merges two YAML value trees:
/// - For mappings (objects), it merges keys from external into default
/// - For scalars and sequences, external values replace default values
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(), // pour les scalaires ou séquences, on remplace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_yaml_keeps_defaults() {
        let mut default: Value = serde_yaml::from_str(DEFAULT_CONFIG).unwrap();
        let external: Value =
            serde_yaml::from_str("images:\n  quality: 60\n  allowed_types: ['*']\n").unwrap();
        merge_yaml(&mut default, &external);

        let quality = Config::get_value_internal(&default, &["images", "quality"]).unwrap();
        assert_eq!(quality, Value::Number(Number::from(60)));
        let exhaust = Config::get_value_internal(&default, &["images", "exhaust_path"]).unwrap();
        assert_eq!(exhaust, Value::String("./exhaust".into()));
        let types = Config::get_value_internal(&default, &["images", "allowed_types"]).unwrap();
        assert_eq!(types, serde_yaml::from_str::<Value>("['*']").unwrap());
    }

    #[test]
    fn test_load_and_typed_getters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.yaml"),
            "Host:\n  HTTP_Port: 8081\nproxy:\n  host_map:\n    a.example: http://backend-a\n    b.example:\n      backend_url: http://backend-b\n",
        )
        .unwrap();

        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.get_http_port(), 8081);
        assert_eq!(config.get_listen(), "127.0.0.1");
        assert_eq!(config.get_usize(&["lazy", "queue_capacity"], 0), 1000);
        assert!(!config.get_bool(&["lazy", "enabled"], true));
        assert_eq!(
            config.get_string_list(&["images", "allowed_types"], &[]),
            vec!["jpg", "png", "jpeg", "bmp"]
        );

        let hosts = config.get_string_map(&["proxy", "host_map"], "backend_url");
        assert_eq!(hosts.get("a.example").map(String::as_str), Some("http://backend-a"));
        assert_eq!(hosts.get("b.example").map(String::as_str), Some("http://backend-b"));

        config.set_http_port(9000).unwrap();
        let reloaded = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(reloaded.get_http_port(), 9000);
    }

    #[test]
    fn test_embedded_does_not_touch_disk() {
        let config = Config::embedded();
        assert_eq!(config.get_http_port(), DEFAULT_HTTP_PORT);
        assert!(config.set_http_port(1234).is_ok());
        assert_eq!(config.get_http_port(), 1234);
    }
}

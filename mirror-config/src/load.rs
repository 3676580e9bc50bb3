use std::path::{Path, PathBuf};
use std::{fmt, io};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable overrides, e.g. `MIRROR_MAX_APPLY_ATTEMPTS`.
const ENV_PREFIX: &str = "MIRROR";

const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys in environment variables.
const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Trait implemented by configuration structures loadable through [`load_config`].
pub trait Config {
    /// Keys whose values should be parsed as comma-separated lists from environment variables.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Which configuration layer is being loaded.
#[derive(Debug, Clone, Copy)]
enum ConfigLayer {
    Base,
    Environment(Environment),
}

impl ConfigLayer {
    fn stem(&self) -> &'static str {
        match self {
            ConfigLayer::Base => "base",
            ConfigLayer::Environment(env) => env.as_str(),
        }
    }
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigLayer::Base => f.write_str("base configuration"),
            ConfigLayer::Environment(env) => write!(f, "{env} environment configuration"),
        }
    }
}

/// Errors that can occur while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate the base configuration in `{directory}`; attempted: {attempted}")]
    BaseConfigurationMissing { directory: PathBuf, attempted: String },

    #[error("failed to load {layer} from `{path}`: {source}")]
    ConfigurationFileLoad {
        layer: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads layered configuration from the `configuration` directory of the working directory.
///
/// See [`load_config_from`] for the layering rules.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&base_path.join(CONFIGURATION_DIR), environment)
}

/// Loads layered configuration from `directory`.
///
/// `base.(yaml|yml|json)` is required. `{environment}.(yaml|yml|json)` is layered on top when
/// present, followed by `MIRROR_`-prefixed environment variables. Nested keys use double
/// underscores (`MIRROR_SOME__KEY`) and list values are comma-separated.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = match find_configuration_file(directory, ConfigLayer::Base) {
        Ok(path) => path,
        Err(attempted) => {
            return Err(LoadConfigError::BaseConfigurationMissing {
                directory: directory.to_path_buf(),
                attempted,
            });
        }
    };

    let builder = rust_cli_config::Config::builder()
        .add_source(rust_cli_config::File::from(base_file.clone()));
    validate_layer(&builder, ConfigLayer::Base, &base_file)?;

    let layer = ConfigLayer::Environment(environment);
    let builder = match find_configuration_file(directory, layer) {
        Ok(environment_file) => {
            let builder =
                builder.add_source(rust_cli_config::File::from(environment_file.clone()));
            validate_layer(&builder, layer, &environment_file)?;
            builder
        }
        Err(_) => builder,
    };

    let mut environment_source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in T::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    builder
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Returns the first existing file for `layer`, or the list of attempted paths.
fn find_configuration_file(directory: &Path, layer: ConfigLayer) -> Result<PathBuf, String> {
    let mut attempted = Vec::with_capacity(CONFIG_FILE_EXTENSIONS.len());

    for extension in CONFIG_FILE_EXTENSIONS {
        let path = directory.join(format!("{}.{extension}", layer.stem()));
        if path.is_file() {
            return Ok(path);
        }

        attempted.push(format!("`{}`", path.display()));
    }

    Err(attempted.join(", "))
}

fn validate_layer(
    builder: &ConfigBuilder<DefaultState>,
    layer: ConfigLayer,
    path: &Path,
) -> Result<(), LoadConfigError> {
    builder
        .clone()
        .build()
        .map(|_| ())
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            layer: layer.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::{env, fs};

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use toml::{Table, Value};
use vt_interfaces::{ConfigConsumer, ConfigProviderInterface};

lazy_static! {
    /// Home of the store state. `$VT_HOME` when set, otherwise `$HOME/.vt`.
    pub static ref VT_HOME_DIR: PathBuf = match env::var("VT_HOME") {
        Ok(home) => home.into(),
        Err(_) => env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".vt"),
    };
}

/// The implementation of a configuration loader that uses the `toml` backend.
#[derive(Default)]
pub struct TomlConfigProvider {
    /// The [`ConfigProviderInterface`] does not put any constraints on the
    /// format of the document, except that we need a `[key: string]->any`
    /// mapping. The [`Table`] is that map.
    table: Mutex<Table>,
}

impl Clone for TomlConfigProvider {
    fn clone(&self) -> Self {
        let guard = self.table.lock().expect("Failed to lock.");
        Self {
            table: Mutex::new(guard.clone()),
        }
    }
}

impl TomlConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the section of `T` with the given value.
    pub fn inject<T: ConfigConsumer>(&self, config: T::Config) -> Result<()> {
        let value = Value::try_from(&config)
            .with_context(|| format!("Could not serialize the '{}' config.", T::KEY))?;
        let mut table = self.table.lock().expect("Failed to acquire lock");
        table.insert(T::KEY.to_owned(), value);
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table = toml::from_str::<Table>(content)
            .context("Could not parse the configuration as toml.")?;
        Ok(Self {
            table: table.into(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow!(
                "The configuration file '{}' does not exist.",
                path.to_string_lossy()
            ));
        }

        let content = fs::read_to_string(path).with_context(|| {
            format!(
                "IO: Could not load the configuration file '{}'.",
                path.to_string_lossy()
            )
        })?;

        Self::from_toml_str(&content).with_context(|| {
            format!(
                "Could not parse the configuration file '{}' as toml.",
                path.to_string_lossy()
            )
        })
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(&path, self.serialize_config()).with_context(|| {
            format!(
                "Could not write the configuration file: {}",
                path.as_ref().to_string_lossy()
            )
        })
    }

    /// Like [`ConfigProviderInterface::get`] but reports a malformed section instead of
    /// panicking.
    pub fn try_get<S: ConfigConsumer>(&self) -> Result<S::Config> {
        tracing::trace!("Getting the config for {}", std::any::type_name::<S>());

        let mut table = self.table.lock().expect("failed to acquire lock");

        let item: S::Config = match table.get(S::KEY) {
            Some(v) => v
                .clone()
                .try_into()
                .with_context(|| format!("Failed to deserialize '{}' config.", S::KEY))?,
            // If the key is not found, use the default config.
            None => S::Config::default(),
        };

        // Amend the internal table with the parsed or default item to be serialized later.
        let value = Value::try_from(&item)
            .with_context(|| format!("Could not serialize the '{}' config.", S::KEY))?;
        table.insert(S::KEY.into(), value);

        Ok(item)
    }

    pub fn into_inner(&self) -> Table {
        self.table.lock().unwrap().clone()
    }
}

impl ConfigProviderInterface for TomlConfigProvider {
    fn get<S: ConfigConsumer>(&self) -> S::Config {
        self.try_get::<S>()
            .unwrap_or_else(|e| panic!("Failed to load '{}' config: {e:#}", S::KEY))
    }

    fn serialize_config(&self) -> String {
        toml::to_string(&*self.table.lock().expect("failed to acquire lock"))
            .expect("failed to serialize config")
    }
}

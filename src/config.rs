//! Startup configuration: `LARDER_*` environment variables plus an optional
//! TOML catalog file describing open hours per book.

use std::path::{Path, PathBuf};

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::calendar::{parse_time, Catalog, ExcludedStart};
use crate::model::Book;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Regina;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("reading catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("catalog: {0}")]
    Catalog(String),
}

/// Organization time zone and the unit catalog of each book.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    pub timezone: Tz,
    pub pantry: Catalog,
    pub volunteer: Catalog,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            pantry: Catalog::default(),
            volunteer: Catalog::default(),
        }
    }
}

impl CatalogConfig {
    pub fn catalog(&self, book: Book) -> &Catalog {
        match book {
            Book::Pantry => &self.pantry,
            Book::Volunteer => &self.volunteer,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = toml::from_str(text)?;
        let timezone = match file.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::Catalog(format!("unknown time zone {name:?}")))?,
            None => DEFAULT_TIMEZONE,
        };
        Ok(Self {
            timezone,
            pantry: file.pantry.unwrap_or_default().into_catalog()?,
            volunteer: file.volunteer.unwrap_or_default().into_catalog()?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    timezone: Option<String>,
    pantry: Option<BookSection>,
    volunteer: Option<BookSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BookSection {
    weekend: Option<[String; 2]>,
    open_from: Option<String>,
    open_until: Option<String>,
    #[serde(default)]
    excluded_starts: Vec<ExcludedStartEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExcludedStartEntry {
    weekday: String,
    start: String,
}

fn weekday(s: &str) -> Result<Weekday, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::Catalog(format!("unknown weekday {s:?}")))
}

fn time(s: &str) -> Result<NaiveTime, ConfigError> {
    parse_time(s).ok_or_else(|| ConfigError::Catalog(format!("bad time {s:?}")))
}

impl BookSection {
    fn into_catalog(self) -> Result<Catalog, ConfigError> {
        let defaults = Catalog::default();
        let weekend = match &self.weekend {
            Some([a, b]) => [weekday(a)?, weekday(b)?],
            None => defaults.weekend,
        };
        let open_from = self.open_from.as_deref().map(time).transpose()?.unwrap_or(defaults.open_from);
        let open_until = self
            .open_until
            .as_deref()
            .map(time)
            .transpose()?
            .unwrap_or(defaults.open_until);
        if open_from >= open_until {
            return Err(ConfigError::Catalog(format!(
                "open_until {open_until} is not after open_from {open_from}"
            )));
        }
        let excluded_starts = self
            .excluded_starts
            .iter()
            .map(|e| {
                Ok(ExcludedStart {
                    weekday: weekday(&e.weekday)?,
                    start: time(&e.start)?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Catalog {
            weekend,
            open_from,
            open_until,
            excluded_starts,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared password for holder connections.
    pub password: String,
    pub staff_user: String,
    pub staff_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub public_url: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub catalog: CatalogConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(
            get: &impl Fn(&str) -> Option<String>,
            var: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match get(var) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::Invalid { var, value }),
                None => Ok(None),
            }
        }

        let catalog = match get("LARDER_CATALOG") {
            Some(path) => CatalogConfig::load(Path::new(&path))?,
            None => CatalogConfig::default(),
        };

        Ok(Self {
            port: parsed(&get, "LARDER_PORT")?.unwrap_or(5433),
            bind: get("LARDER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("LARDER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("LARDER_PASSWORD").unwrap_or_else(|| "larder".into()),
            staff_user: get("LARDER_STAFF_USER").unwrap_or_else(|| "staff".into()),
            staff_password: get("LARDER_STAFF_PASSWORD").unwrap_or_else(|| "larder-staff".into()),
            max_connections: parsed(&get, "LARDER_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "LARDER_COMPACT_THRESHOLD")?.unwrap_or(1000),
            public_url: get("LARDER_PUBLIC_URL").unwrap_or_else(|| "http://localhost:8080".into()),
            tls_cert: get("LARDER_TLS_CERT"),
            tls_key: get("LARDER_TLS_KEY"),
            metrics_port: parsed(&get, "LARDER_METRICS_PORT")?,
            catalog,
        })
    }
}

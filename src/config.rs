use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `CHAIRBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the compactor rewrites a tenant log.
    pub compact_threshold: u64,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
#[error("{var}: cannot parse {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "chairbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their default;
    /// set but malformed ones are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            port: parsed(&lookup, "CHAIRBOOK_PORT")?.unwrap_or(defaults.port),
            bind: lookup("CHAIRBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CHAIRBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("CHAIRBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "CHAIRBOOK_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "CHAIRBOOK_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("CHAIRBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("CHAIRBOOK_TLS_KEY").map(PathBuf::from),
            metrics_port: parsed(&lookup, "CHAIRBOOK_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
    }

    #[test]
    fn overrides_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("CHAIRBOOK_PORT", "6543"),
            ("CHAIRBOOK_BIND", "127.0.0.1"),
            ("CHAIRBOOK_DATA_DIR", "/var/lib/chairbook"),
            ("CHAIRBOOK_MAX_CONNECTIONS", " 32 "),
            ("CHAIRBOOK_METRICS_PORT", "9090"),
            ("CHAIRBOOK_TLS_CERT", "cert.pem"),
            ("CHAIRBOOK_TLS_KEY", "key.pem"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/chairbook"));
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.metrics_port, Some(9090));
        assert_eq!(config.tls_cert, Some(PathBuf::from("cert.pem")));
        assert_eq!(config.compact_threshold, 1000);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("CHAIRBOOK_PORT", "fivethousand")])).unwrap_err();
        assert_eq!(err.var, "CHAIRBOOK_PORT");
        assert_eq!(err.value, "fivethousand");
    }
}

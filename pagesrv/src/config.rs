use pages::config::OutputFormat;
use pages::{ConfigError, StaticPagesConfig};
use std::path::PathBuf;
use thiserror::Error;

/// Flag- and environment-level settings layered on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub debug: bool,
    pub format: Option<OutputFormat>,
}

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error(
        "no config file found; looked for config.yaml in ., $HOME, \
         $HOME/.config/pagesrv and /data"
    )]
    NotFound,

    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("invalid value in environment variable {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Loads and validates the configuration.
///
/// Precedence, lowest to highest: config file, `SP_*` environment
/// variables, command-line flags.
pub fn load(overrides: &Overrides) -> Result<StaticPagesConfig, ConfigLoadError> {
    let path = match &overrides.config {
        Some(path) => path.clone(),
        None => discover_config_file().ok_or(ConfigLoadError::NotFound)?,
    };

    let mut config = StaticPagesConfig::from_file(&path)?;

    apply_env_overrides(&mut config)?;
    apply_flag_overrides(&mut config, overrides);

    config.validate()?;
    Ok(config)
}

fn discover_config_file() -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from("config.yaml")];
    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        candidates.push(home.join("config.yaml"));
        candidates.push(home.join(".config/pagesrv/config.yaml"));
    }
    candidates.push(PathBuf::from("/data/config.yaml"));

    candidates.into_iter().find(|path| path.is_file())
}

fn apply_env_overrides(config: &mut StaticPagesConfig) -> Result<(), ConfigLoadError> {
    if let Some(host) = env_string("SP_SERVER_HOST") {
        config.server.host = host;
    }
    if let Some(port) = env_parsed::<u16>("SP_SERVER_PROXYPORT")? {
        config.server.proxy_port = port;
    }
    if let Some(port) = env_parsed::<u16>("SP_SERVER_APIPORT")? {
        config.server.api_port = port;
    }
    if let Some(debug) = env_parsed::<bool>("SP_OUTPUT_DEBUG")? {
        config.output.debug = debug;
    }
    if let Some(format) = env_string("SP_OUTPUT_FORMAT") {
        config.output.format = match format.as_str() {
            "short" => OutputFormat::Short,
            "long" => OutputFormat::Long,
            other => {
                return Err(ConfigLoadError::InvalidEnv {
                    name: "SP_OUTPUT_FORMAT",
                    value: other.to_string(),
                });
            }
        };
    }
    Ok(())
}

fn apply_flag_overrides(config: &mut StaticPagesConfig, overrides: &Overrides) {
    if let Some(port) = overrides.port {
        config.server.proxy_port = port;
    }
    if let Some(host) = &overrides.host {
        config.server.host = host.clone();
    }
    if overrides.debug {
        config.output.debug = true;
    }
    if let Some(format) = overrides.format {
        config.output.format = format;
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigLoadError> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidEnv { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        write!(file, "{yaml}").expect("write yaml");
        file
    }

    #[test]
    fn test_load_with_flag_overrides() {
        let file = write_config("server:\n  proxyPort: 7000\n");
        let overrides = Overrides {
            config: Some(file.path().to_path_buf()),
            port: Some(7777),
            host: Some("0.0.0.0".to_string()),
            debug: true,
            format: Some(OutputFormat::Long),
        };

        let config = load(&overrides).unwrap();
        // the flag outranks the file
        assert_eq!(config.server.proxy_port, 7777);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.output.debug);
        assert_eq!(config.output.format, OutputFormat::Long);
    }

    #[test]
    fn test_load_invalid_page_fails() {
        let file = write_config(
            r#"
pages:
  - domain: example.com
    bucket:
      url: https://s3.example
      name: bucket
      applicationId: id
      secret: ""
    proxy:
      url: https://origin.example
    git:
      provider: github
      repository: org/repo
"#,
        );
        let overrides = Overrides {
            config: Some(file.path().to_path_buf()),
            ..Overrides::default()
        };

        let error = load(&overrides).unwrap_err();
        assert!(error.to_string().contains("bucket.secret"));
    }

    #[test]
    fn test_missing_explicit_config_errors() {
        let overrides = Overrides {
            config: Some(PathBuf::from("/definitely/not/here.yaml")),
            ..Overrides::default()
        };
        assert!(load(&overrides).is_err());
    }
}

//! Agent configuration loading

use anyhow::{Context, Result};
use qos_lib::QosConfig;

const CONFIG_FILE_ENV: &str = "QOS_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "/etc/qos-agent/config.toml";

/// Load configuration from an optional file overlaid by `QOS_*` environment variables
pub fn load() -> Result<QosConfig> {
    let path = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_from(&path)
}

fn load_from(path: &str) -> Result<QosConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("QOS").try_parsing(true))
        .build()
        .with_context(|| format!("failed to read configuration from {}", path))?;

    let config: QosConfig = config
        .try_deserialize()
        .context("invalid configuration")?;
    let config = config.normalized();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_from("/nonexistent/qos-agent.toml").unwrap();
        assert_eq!(config.tdp_threshold, 0.98);
        assert_eq!(config.abnormal_threshold, 3);
        assert!(!config.net_qos_management);
    }

    #[test]
    fn test_file_values_are_validated_and_normalized() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "tdp_threshold = 0.9").unwrap();
        writeln!(file, "net_qos_bandwidth_high = \"2GB\"").unwrap();
        let config = load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.tdp_threshold, 0.9);
        assert_eq!(config.net_qos_bandwidth_high, "2gb");

        let mut bad = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(bad, "tdp_threshold = 1.1").unwrap();
        assert!(load_from(bad.path().to_str().unwrap()).is_err());
    }
}

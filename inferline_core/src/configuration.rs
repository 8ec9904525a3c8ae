use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use twelf::{config, Layer};

const DEFAULT_MAX_BATCH_SIZE: usize = 4;
const DEFAULT_MAX_BATCH_WAIT: Duration = Duration::from_millis(20);
const DEFAULT_MAX_IN_FLIGHT: usize = 2;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelector {
    Cpu,
    Gpu,
    Auto,
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_max_batch_wait() -> Duration {
    DEFAULT_MAX_BATCH_WAIT
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_device_selector() -> DeviceSelector {
    DeviceSelector::Auto
}

#[config]
#[derive(Debug, Serialize, Clone)]
pub struct InferenceConfiguration {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_wait")]
    pub max_batch_wait: Duration,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_device_selector")]
    pub device_selector: DeviceSelector,
}

impl Default for InferenceConfiguration {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_wait: DEFAULT_MAX_BATCH_WAIT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            device_selector: DeviceSelector::Auto,
        }
    }
}

impl InferenceConfiguration {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            anyhow::bail!("max_batch_size must be at least 1");
        }
        if self.max_in_flight == 0 {
            anyhow::bail!("max_in_flight must be at least 1");
        }
        if self.max_batch_wait.is_zero() {
            anyhow::bail!("max_batch_wait must be positive");
        }
        Ok(())
    }

    pub fn new(path: &str) -> Result<Self> {
        let conf = Self::with_layers(&[Layer::Json(path.into())])?;
        conf.validate()?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply_to_sparse_file() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(file, "{}", serde_json::json!({"max_batch_size": 8}))?;
        let conf = InferenceConfiguration::new(file.path().to_str().unwrap())?;
        assert_eq!(conf.max_batch_size, 8);
        assert_eq!(conf.max_batch_wait, DEFAULT_MAX_BATCH_WAIT);
        assert_eq!(conf.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(conf.device_selector, DeviceSelector::Auto);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_bounds() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(file, r#"{{"max_in_flight": 0}}"#)?;
        assert!(InferenceConfiguration::new(file.path().to_str().unwrap()).is_err());
        Ok(())
    }

    #[test]
    fn test_device_selector_parses_lowercase() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        write!(file, r#"{{"device_selector": "gpu"}}"#)?;
        let conf = InferenceConfiguration::new(file.path().to_str().unwrap())?;
        assert_eq!(conf.device_selector, DeviceSelector::Gpu);
        Ok(())
    }
}

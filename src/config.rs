use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dispatch::OutputAction;
use crate::error::AppError;
use crate::launcher::SideEffect;

const DEFAULT_CHIP: &str = "/dev/gpiochip0";
const DEFAULT_LAUNCH_QUEUE_CAPACITY: usize = 64;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub name: String,
    pub line: u32,
    #[serde(default = "default_true")]
    pub initial_level: bool,
    #[serde(default)]
    pub shutdown_level: bool,
    #[serde(default)]
    pub lock_direction: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InputConfig {
    pub name: String,
    pub line: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Name of the output this input drives.
    pub output: String,
    pub action: OutputAction,
    #[serde(default)]
    pub lock_direction: bool,
    pub side_effect: SideEffect,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_chip")]
    pub chip: String,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default = "default_launch_queue_capacity")]
    pub launch_queue_capacity: usize,
    pub outputs: Vec<OutputConfig>,
    pub inputs: Vec<InputConfig>,
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_string()
}

fn default_launch_queue_capacity() -> usize {
    DEFAULT_LAUNCH_QUEUE_CAPACITY
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Two LEDs and four buttons: each LED gets one "on" and one "off" button.
    pub fn board_default() -> Self {
        let output = |name: &str, line| OutputConfig {
            name: name.to_string(),
            line,
            initial_level: true,
            shutdown_level: false,
            lock_direction: false,
        };
        let input = |name: &str, line, out: &str, action, script: &str| InputConfig {
            name: name.to_string(),
            line,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            output: out.to_string(),
            action,
            lock_direction: false,
            side_effect: SideEffect::new(PathBuf::from(format!("/usr/bin/scripts/{script}"))),
        };

        Self {
            chip: default_chip(),
            http: None,
            launch_queue_capacity: DEFAULT_LAUNCH_QUEUE_CAPACITY,
            outputs: vec![output("led-1", 20), output("led-2", 16)],
            inputs: vec![
                input("button-a", 26, "led-1", OutputAction::On, "1stscript.sh"),
                input("button-b", 19, "led-1", OutputAction::Off, "2ndscript.sh"),
                input("button-c", 13, "led-2", OutputAction::On, "3rdscript.sh"),
                input("button-d", 21, "led-2", OutputAction::Off, "4thscript.sh"),
            ],
        }
    }

    /// Checks names and cross references. Line ids are left to the platform.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.launch_queue_capacity == 0 {
            return Err(AppError::Config(
                "launch_queue_capacity must be greater than zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for name in self
            .outputs
            .iter()
            .map(|o| &o.name)
            .chain(self.inputs.iter().map(|i| &i.name))
        {
            if !names.insert(name.as_str()) {
                return Err(AppError::Config(format!("Duplicate line name: {name}")));
            }
        }

        for input in &self.inputs {
            if !self.outputs.iter().any(|o| o.name == input.output) {
                return Err(AppError::Config(format!(
                    "Input {} references unknown output {}",
                    input.name, input.output
                )));
            }
        }

        Ok(())
    }

    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

pub(crate) fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([("HOME".to_string(), "/".to_string())])
}

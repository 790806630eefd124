// src/configfile.rs
// Printer configuration: an INI-style file with [section] headers and
// `option: value` / `option = value` lines. Components read through the
// typed accessors; range violations name the offending section and option.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("section [{0}] not found")]
    MissingSection(String),
    #[error("option '{option}' in section [{section}] not found")]
    MissingOption { section: String, option: String },
    #[error("option '{option}' in section [{section}]: unable to parse '{value}'")]
    ParseError {
        section: String,
        option: String,
        value: String,
    },
    #[error("option '{option}' in section [{section}]: value {value} outside range {min}..{max}")]
    OutOfRange {
        section: String,
        option: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("config file read error: {0}")]
    Io(String),
    #[error("malformed config line {line}: '{text}'")]
    MalformedLine { line: usize, text: String },
}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Configfile {
    pub fn new() -> Self {
        Configfile::default()
    }

    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let mut cfg = Configfile::new();
        let mut current: Option<String> = None;
        for (lineno, raw) in data.lines().enumerate() {
            let line = match raw.find(['#', ';']) {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or(ConfigError::MalformedLine {
                    line: lineno + 1,
                    text: raw.to_string(),
                })?;
                let name = name.trim().to_string();
                cfg.sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .or_else(|| line.split_once('='))
                .ok_or(ConfigError::MalformedLine {
                    line: lineno + 1,
                    text: raw.to_string(),
                })?;
            let section = current.clone().ok_or(ConfigError::MalformedLine {
                line: lineno + 1,
                text: raw.to_string(),
            })?;
            cfg.set(&section, key.trim(), value.trim());
        }
        Ok(cfg)
    }

    pub fn add_section(&mut self, name: &str) {
        self.sections.entry(name.to_string()).or_default();
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.to_string());
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Section names with the given prefix, e.g. `stepper_` -> all steppers.
    pub fn sections_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.sections
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn raw(&self, section: &str, option: &str) -> Result<&str, ConfigError> {
        let sec = self
            .sections
            .get(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;
        sec.get(option)
            .map(|s| s.as_str())
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        match self.raw(section, option) {
            Ok(v) => Ok(v.to_string()),
            Err(ConfigError::MissingOption { .. }) | Err(ConfigError::MissingSection(_)) => match default {
                Some(d) => Ok(d.to_string()),
                None => Err(ConfigError::MissingOption {
                    section: section.to_string(),
                    option: option.to_string(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let value = match self.raw(section, option) {
            Ok(v) => v.parse::<f64>().map_err(|_| ConfigError::ParseError {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
            })?,
            Err(_) => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        self.check_range(section, option, value, minval, maxval)?;
        Ok(value)
    }

    pub fn getint(
        &self,
        section: &str,
        option: &str,
        default: Option<i64>,
        minval: Option<i64>,
        maxval: Option<i64>,
    ) -> Result<i64, ConfigError> {
        let value = match self.raw(section, option) {
            Ok(v) => v.parse::<i64>().map_err(|_| ConfigError::ParseError {
                section: section.to_string(),
                option: option.to_string(),
                value: v.to_string(),
            })?,
            Err(_) => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            })?,
        };
        if minval.is_some_and(|m| value < m) || maxval.is_some_and(|m| value > m) {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
                min: minval.map_or("-inf".into(), |m| m.to_string()),
                max: maxval.map_or("+inf".into(), |m| m.to_string()),
            });
        }
        Ok(value)
    }

    pub fn getboolean(&self, section: &str, option: &str, default: Option<bool>) -> Result<bool, ConfigError> {
        match self.raw(section, option) {
            Ok(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::ParseError {
                    section: section.to_string(),
                    option: option.to_string(),
                    value: v.to_string(),
                }),
            },
            Err(_) => default.ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                option: option.to_string(),
            }),
        }
    }

    fn check_range(
        &self,
        section: &str,
        option: &str,
        value: f64,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<(), ConfigError> {
        if value.is_nan()
            || minval.is_some_and(|m| value < m)
            || maxval.is_some_and(|m| value > m)
        {
            return Err(ConfigError::OutOfRange {
                section: section.to_string(),
                option: option.to_string(),
                value: value.to_string(),
                min: minval.map_or("-inf".into(), |m| m.to_string()),
                max: maxval.map_or("+inf".into(), |m| m.to_string()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[printer]
max_velocity: 300
max_accel: 3000
square_corner_velocity: 5.0  # mm/s

[stepper_x]
step_distance = 0.0125
position_min: 0
position_max: 200

[mcu]
transport: loopback
";

    #[test]
    fn parses_sections_and_options() {
        let cfg = Configfile::parse(SAMPLE).unwrap();
        assert!(cfg.has_section("printer"));
        assert_eq!(
            cfg.getfloat("printer", "max_velocity", None, Some(0.0), None).unwrap(),
            300.0
        );
        assert_eq!(cfg.getfloat("stepper_x", "step_distance", None, None, None).unwrap(), 0.0125);
        assert_eq!(cfg.get("mcu", "transport", None).unwrap(), "loopback");
    }

    #[test]
    fn inline_comment_is_stripped() {
        let cfg = Configfile::parse(SAMPLE).unwrap();
        assert_eq!(
            cfg.getfloat("printer", "square_corner_velocity", None, None, None).unwrap(),
            5.0
        );
    }

    #[test]
    fn default_applies_when_missing() {
        let cfg = Configfile::parse(SAMPLE).unwrap();
        assert_eq!(
            cfg.getfloat("printer", "minimum_cruise_ratio", Some(0.5), Some(0.0), Some(1.0)).unwrap(),
            0.5
        );
        assert!(cfg.getfloat("printer", "no_such", None, None, None).is_err());
    }

    #[test]
    fn range_violation_names_option() {
        let cfg = Configfile::parse(SAMPLE).unwrap();
        let err = cfg
            .getfloat("printer", "max_velocity", None, None, Some(100.0))
            .unwrap_err();
        match err {
            ConfigError::OutOfRange { section, option, .. } => {
                assert_eq!(section, "printer");
                assert_eq!(option, "max_velocity");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn option_before_section_is_rejected() {
        assert!(matches!(
            Configfile::parse("max_velocity: 300\n"),
            Err(ConfigError::MalformedLine { line: 1, .. })
        ));
    }

    #[test]
    fn stepper_prefix_listing() {
        let cfg = Configfile::parse(SAMPLE).unwrap();
        assert_eq!(cfg.sections_with_prefix("stepper_"), vec!["stepper_x".to_string()]);
    }
}

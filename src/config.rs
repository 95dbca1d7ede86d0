use serde::Deserialize;
use std::{collections::HashMap, fs::read_to_string};

#[derive(Clone, Debug, Deserialize)]
pub struct ChoiceOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Deserialize)]
struct SharedConfig {
    incident: HashMap<String, Vec<ChoiceOption>>,
}

/// Choice sets shared with the front end through `shared-config.json`.
/// Constructed once at startup and handed to handlers as `web::Data`;
/// a missing or malformed file must abort the process before it binds.
#[derive(Clone, Debug)]
pub struct ChoiceConfig {
    fields: HashMap<String, Vec<ChoiceOption>>,
}

impl ChoiceConfig {
    pub fn load(path: &str) -> Result<ChoiceConfig, String> {
        let raw: String =
            read_to_string(path).map_err(|_| format!("CONFIG_NOT_FOUND: {path}"))?;
        Self::from_json(&raw)
    }
    pub fn from_json(raw: &str) -> Result<ChoiceConfig, String> {
        let config: SharedConfig =
            serde_json::from_str(raw).map_err(|error| format!("CONFIG_INVALID: {error}"))?;
        Ok(ChoiceConfig {
            fields: config.incident,
        })
    }
    pub fn choices_for_field(&self, field: &str) -> &[ChoiceOption] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
    pub fn values_for_field(&self, field: &str) -> Vec<&str> {
        self.choices_for_field(field)
            .iter()
            .map(|option| option.value.as_str())
            .collect()
    }
    pub fn is_valid_value(&self, field: &str, value: &str) -> bool {
        self.choices_for_field(field)
            .iter()
            .any(|option| option.value == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RAW: &str = r#"{
        "incident": {
            "levels": [
                { "value": "L2", "label": "L2" },
                { "value": "L5", "label": "L5" }
            ],
            "statuses": [
                { "value": "reported", "label": "Reported" },
                { "value": "closed", "label": "Closed" }
            ]
        }
    }"#;

    #[test]
    fn parses_choice_sets() {
        let config = ChoiceConfig::from_json(RAW).unwrap();
        assert_eq!(config.values_for_field("levels"), vec!["L2", "L5"]);
        assert_eq!(config.choices_for_field("statuses")[0].label, "Reported");
    }

    #[test]
    fn membership_checks() {
        let config = ChoiceConfig::from_json(RAW).unwrap();
        assert!(config.is_valid_value("levels", "L5"));
        assert!(!config.is_valid_value("levels", "L9"));
        assert!(!config.is_valid_value("unknown_field", "L5"));
        assert!(config.choices_for_field("unknown_field").is_empty());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RAW.as_bytes()).unwrap();
        let config = ChoiceConfig::load(file.path().to_str().unwrap()).unwrap();
        assert!(config.is_valid_value("statuses", "closed"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let error = ChoiceConfig::load("./does-not-exist.json").unwrap_err();
        assert!(error.starts_with("CONFIG_NOT_FOUND"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let error = ChoiceConfig::from_json("{ not json").unwrap_err();
        assert!(error.starts_with("CONFIG_INVALID"));
    }
}

//! Built-in output validators.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::step::{Step, StepValidator};

// ---------------------------------------------------------------------------
// StringValidator
// ---------------------------------------------------------------------------

/// Accepts text by exact equality or by regex match.
///
/// Exactly one of `equal_to` / `match_regex` must be configured; `init`
/// rejects both-absent and both-present. The regex is compiled eagerly at
/// init and re-compiled on demand when init was bypassed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StringValidator {
    pub equal_to: Option<String>,
    pub match_regex: Option<String>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl StringValidator {
    pub fn equal_to(value: impl Into<String>) -> Self {
        Self {
            equal_to: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            match_regex: Some(pattern.into()),
            ..Default::default()
        }
    }
}

impl StepValidator for StringValidator {
    fn init(&mut self) -> Result<(), anyhow::Error> {
        match (&self.equal_to, &self.match_regex) {
            (None, None) => {
                return Err(anyhow::anyhow!(
                    "string validator requires one of equal_to or match_regex"
                ))
            }
            (Some(_), Some(_)) => {
                return Err(anyhow::anyhow!(
                    "string validator accepts only one of equal_to and match_regex"
                ))
            }
            (None, Some(pattern)) => {
                self.compiled = Some(
                    Regex::new(pattern)
                        .map_err(|e| anyhow::anyhow!("invalid match_regex: {}", e))?,
                );
            }
            (Some(_), None) => {}
        }
        Ok(())
    }

    fn validate(&self, text: &str, _step: &Step) -> bool {
        if let Some(expected) = &self.equal_to {
            return text == expected;
        }
        if let Some(pattern) = &self.match_regex {
            if let Some(re) = &self.compiled {
                return re.is_match(text);
            }
            // Init was bypassed; a malformed pattern rejects everything.
            return match Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(_) => false,
            };
        }
        false
    }

    fn clone_box(&self) -> Box<dyn StepValidator> {
        Box::new(self.clone())
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonValidator
// ---------------------------------------------------------------------------

/// Accepts any well-formed JSON value: object, array or scalar.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JsonValidator;

impl StepValidator for JsonValidator {
    fn validate(&self, text: &str, _step: &Step) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        serde_json::from_str::<Value>(text).is_ok()
    }

    fn clone_box(&self) -> Box<dyn StepValidator> {
        Box::new(*self)
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::step::StepExecutor;
    use crate::flow::FlowContext;
    use async_trait::async_trait;

    #[derive(Debug, Clone, Default)]
    struct NoopExecutor;

    #[async_trait]
    impl StepExecutor for NoopExecutor {
        async fn run(&self, _ctx: &mut FlowContext, _step: &Step) -> Result<(), anyhow::Error> {
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn StepExecutor> {
            Box::new(self.clone())
        }

        fn load_config(&mut self, _config: &Value) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    fn dummy_step() -> Step {
        Step::new("test", Box::new(NoopExecutor))
    }

    #[test]
    fn test_string_validator_requires_exactly_one_mode() {
        let mut neither = StringValidator::default();
        assert!(neither.init().is_err());

        let mut both = StringValidator {
            equal_to: Some("a".to_string()),
            match_regex: Some("a".to_string()),
            ..Default::default()
        };
        assert!(both.init().is_err());
    }

    #[test]
    fn test_string_validator_equality() {
        let mut v = StringValidator::equal_to("OK");
        v.init().unwrap();
        let step = dummy_step();
        assert!(v.validate("OK", &step));
        assert!(!v.validate("NO", &step));
        assert!(!v.validate("ok", &step));
    }

    #[test]
    fn test_string_validator_regex() {
        let mut v = StringValidator::matching(r"^\d{4}$");
        v.init().unwrap();
        let step = dummy_step();
        assert!(v.validate("2048", &step));
        assert!(!v.validate("20x8", &step));
    }

    #[test]
    fn test_string_validator_invalid_regex_at_init() {
        let mut v = StringValidator::matching("[unclosed");
        assert!(v.init().is_err());
    }

    #[test]
    fn test_string_validator_invalid_regex_without_init_rejects() {
        let v = StringValidator::matching("[unclosed");
        assert!(!v.validate("anything", &dummy_step()));
    }

    #[test]
    fn test_string_validator_regex_without_init_still_matches() {
        let v = StringValidator::matching("moon");
        assert!(v.validate("over the moon", &dummy_step()));
    }

    #[test]
    fn test_string_validator_clone_on_get_contract() {
        let mut v = StringValidator::matching("x+");
        v.init().unwrap();
        let a = v.clone_box();
        let b = v.clone_box();
        assert!(!std::ptr::eq(a.as_ref(), b.as_ref()));
        assert!(a.validate("xxx", &dummy_step()));
        assert!(b.validate("xxx", &dummy_step()));
    }

    #[test]
    fn test_json_validator() {
        let v = JsonValidator;
        let step = dummy_step();
        assert!(v.validate(r#"{"a": 1}"#, &step));
        assert!(v.validate("[1, 2, 3]", &step));
        assert!(v.validate("42", &step));
        assert!(v.validate("\"scalar\"", &step));
        assert!(v.validate("true", &step));
        assert!(!v.validate("", &step));
        assert!(!v.validate("   ", &step));
        assert!(!v.validate("{broken", &step));
        assert!(!v.validate("{} trailing", &step));
    }

    #[test]
    fn test_string_validator_load_config() {
        let mut v = StringValidator::default();
        v.load_config(&serde_json::json!({"equal_to": "yes"}))
            .unwrap();
        StepValidator::init(&mut v).unwrap();
        assert!(v.validate("yes", &dummy_step()));
    }
}

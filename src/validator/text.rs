//! Text query validator
//!
//! Treats the fetched bytes as plaintext, JSON, or YAML, runs a JSONPath
//! query against them, and accepts or rejects the key by comparing the
//! query result with a templated expectation. Optionally the query result
//! replaces the key's data.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json_path::JsonPath;

use super::{check_template, render_template, DataMsg, TemplateVars, Validator, ValidatorConfig};
use crate::error::Error;
use crate::fetcher::DataMap;

/// Registry name of the text validator.
pub const METHOD_TEXT: &str = "text";

/// Payload schema: raw text, wrapped as a JSON string for querying.
pub const TEXT_SCHEMA_PLAINTEXT: &str = "plaintext";
/// Payload schema: JSON document.
pub const TEXT_SCHEMA_JSON: &str = "json";
/// Payload schema: YAML document.
pub const TEXT_SCHEMA_YAML: &str = "yaml";

/// Expectations for the query result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextExpect {
    /// Schema of the payload: `plaintext` (default), `json`, or `yaml`
    pub schema: String,

    /// Expected query result (template); empty accepts any result
    pub data: String,
}

/// Text validator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextValidatorConfig {
    /// Replace the key's data with the query result on success
    pub query_result_as_data: bool,

    /// JSONPath query to run against the payload
    pub query: String,

    /// Expectations for the query result
    pub expect: TextExpect,
}

/// Build a text validator from its config.
pub fn new_text_validator(config: &ValidatorConfig) -> Result<Box<dyn Validator>, Error> {
    let text = config
        .text
        .as_ref()
        .ok_or_else(|| Error::config("no text validator configuration provided"))?;

    match text.expect.schema.as_str() {
        "" | TEXT_SCHEMA_PLAINTEXT | TEXT_SCHEMA_JSON | TEXT_SCHEMA_YAML => {}
        other => {
            return Err(Error::config(format!(
                "unsupported text schema {other:?}"
            )))
        }
    }

    let query = JsonPath::parse(&text.query)
        .map_err(|e| Error::config(format!("failed to parse query {:?}: {e}", text.query)))?;

    if !text.expect.data.is_empty() {
        check_template(&text.expect.data)?;
    }

    Ok(Box::new(TextValidator {
        data_keys: config.data_keys.clone(),
        query,
        query_result_as_data: text.query_result_as_data,
        schema: text.expect.schema.clone(),
        expect_data: if text.expect.data.is_empty() {
            None
        } else {
            Some(text.expect.data.clone())
        },
    }))
}

#[derive(Debug)]
struct TextValidator {
    data_keys: Vec<String>,
    query: JsonPath,
    query_result_as_data: bool,
    schema: String,
    expect_data: Option<String>,
}

impl TextValidator {
    fn validate_key(&self, key: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let input: serde_json::Value = match self.schema.as_str() {
            TEXT_SCHEMA_JSON => serde_json::from_slice(payload)
                .map_err(|e| Error::sync(format!("json schema not valid: {e}")))?,
            TEXT_SCHEMA_YAML => serde_yaml::from_slice(payload)
                .map_err(|e| Error::sync(format!("yaml schema not valid: {e}")))?,
            _ => serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
        };

        let nodes = self.query.query(&input).all();
        let result = nodes
            .into_iter()
            .next()
            .ok_or_else(|| Error::sync("no result found for query"))?;

        let result_text = match result {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other)
                .map_err(|e| Error::sync(format!("failed to encode query result: {e}")))?,
        };

        if let Some(expect) = &self.expect_data {
            let vars = TemplateVars {
                data_keys: &self.data_keys,
                data_key: key,
                data: payload,
            };
            let expected = render_template(expect, &vars)?;
            if result_text != expected {
                return Err(Error::sync(format!(
                    "query result unexpected: got {result_text:?}, want {expected:?}"
                )));
            }
        }

        if self.query_result_as_data {
            if self.schema == TEXT_SCHEMA_YAML {
                let yaml = serde_yaml::to_string(result)
                    .map_err(|e| Error::sync(format!("failed to encode result as yaml: {e}")))?;
                return Ok(yaml.into_bytes());
            }
            return Ok(result_text.into_bytes());
        }

        Ok(payload.to_vec())
    }
}

#[async_trait]
impl Validator for TextValidator {
    async fn validate(&self, data: &DataMap) -> DataMsg {
        let mut msg = DataMsg::default();
        for key in &self.data_keys {
            let Some(payload) = data.get(key) else {
                continue;
            };
            match self.validate_key(key, payload) {
                Ok(out) => {
                    msg.data.insert(key.clone(), out);
                }
                Err(err) => {
                    msg.errors.insert(key.clone(), err);
                }
            }
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: &[&str], text: TextValidatorConfig) -> Box<dyn Validator> {
        let config = ValidatorConfig {
            method: METHOD_TEXT.to_string(),
            data_keys: keys.iter().map(|s| s.to_string()).collect(),
            http: None,
            text: Some(text),
        };
        new_text_validator(&config).unwrap()
    }

    fn data(entries: &[(&str, &str)]) -> DataMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn json_query_with_matching_expectation_accepts() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query: "$.version".to_string(),
                expect: TextExpect {
                    schema: TEXT_SCHEMA_JSON.to_string(),
                    data: "2".to_string(),
                },
                ..Default::default()
            },
        );

        let msg = v.validate(&data(&[("cfg", r#"{"version": 2}"#)])).await;
        assert!(msg.errors.is_empty());
        assert_eq!(msg.data["cfg"], br#"{"version": 2}"#.to_vec());
    }

    #[tokio::test]
    async fn mismatched_expectation_rejects_key() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query: "$.version".to_string(),
                expect: TextExpect {
                    schema: TEXT_SCHEMA_JSON.to_string(),
                    data: "3".to_string(),
                },
                ..Default::default()
            },
        );

        let msg = v.validate(&data(&[("cfg", r#"{"version": 2}"#)])).await;
        assert!(msg.data.is_empty());
        assert!(msg.errors.contains_key("cfg"));
    }

    #[tokio::test]
    async fn invalid_json_rejects_key() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query: "$.version".to_string(),
                expect: TextExpect {
                    schema: TEXT_SCHEMA_JSON.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let msg = v.validate(&data(&[("cfg", "not json")])).await;
        assert!(msg.errors.contains_key("cfg"));
    }

    #[tokio::test]
    async fn query_result_replaces_data_when_requested() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query_result_as_data: true,
                query: "$.inner".to_string(),
                expect: TextExpect {
                    schema: TEXT_SCHEMA_JSON.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let msg = v
            .validate(&data(&[("cfg", r#"{"inner": "extracted"}"#)]))
            .await;
        assert_eq!(msg.data["cfg"], b"extracted".to_vec());
    }

    #[tokio::test]
    async fn plaintext_wraps_payload_as_string() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query: "$".to_string(),
                expect: TextExpect {
                    data: "hello".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let msg = v.validate(&data(&[("cfg", "hello")])).await;
        assert!(msg.errors.is_empty(), "{:?}", msg.errors.keys());
    }

    #[tokio::test]
    async fn unconfigured_keys_pass_through_untouched() {
        let v = build(
            &["cfg"],
            TextValidatorConfig {
                query: "$".to_string(),
                ..Default::default()
            },
        );

        let msg = v.validate(&data(&[("other", "whatever")])).await;
        assert!(msg.data.is_empty());
        assert!(msg.errors.is_empty());
    }

    #[test]
    fn invalid_query_fails_construction() {
        let config = ValidatorConfig {
            method: METHOD_TEXT.to_string(),
            data_keys: vec!["cfg".to_string()],
            http: None,
            text: Some(TextValidatorConfig {
                query: "$[".to_string(),
                ..Default::default()
            }),
        };
        assert!(new_text_validator(&config).is_err());
    }

    #[test]
    fn missing_text_config_fails_construction() {
        let config = ValidatorConfig {
            method: METHOD_TEXT.to_string(),
            data_keys: vec![],
            http: None,
            text: None,
        };
        assert!(new_text_validator(&config).is_err());
    }
}

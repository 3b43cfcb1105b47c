//! `${name}` placeholder resolution
//!
//! Tokens resolve against the supplied properties first, then against the
//! process-wide properties. Blank values count as absent. A token neither
//! source can resolve is left in place so a later resume can fill it in.
//!
//! Applied to a whole instance, substitution walks every string in its JSON
//! form (object keys included), so a placeholder anywhere in the instance is
//! eligible and the result always deserializes back.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(.+?)\}").expect("placeholder pattern is valid"));

fn lookup<'a>(properties: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    properties
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// Replace every resolvable `${key}` token in `text`
pub fn substitute<'t>(
    text: &'t str,
    properties: &BTreeMap<String, String>,
    fallback: &BTreeMap<String, String>,
) -> Cow<'t, str> {
    if !text.contains("${") {
        return Cow::Borrowed(text);
    }

    PLACEHOLDER.replace_all(text, |caps: &Captures| {
        let key = &caps[1];
        lookup(properties, key)
            .or_else(|| lookup(fallback, key))
            .map(str::to_string)
            .unwrap_or_else(|| caps[0].to_string())
    })
}

/// Templating pass bound to the process-wide fallback properties
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    fallback: BTreeMap<String, String>,
}

impl TemplateEngine {
    pub fn new(fallback: BTreeMap<String, String>) -> Self {
        Self { fallback }
    }

    pub fn fallback(&self) -> &BTreeMap<String, String> {
        &self.fallback
    }

    /// Substitute placeholders in a single string
    pub fn substitute(&self, text: &str, properties: &BTreeMap<String, String>) -> String {
        substitute(text, properties, &self.fallback).into_owned()
    }

    /// Substitute placeholders across the serialized form of `value`
    pub fn apply<T>(
        &self,
        value: &T,
        properties: &BTreeMap<String, String>,
    ) -> Result<T, serde_json::Error>
    where
        T: Serialize + DeserializeOwned,
    {
        let json = serde_json::to_value(value)?;
        let resolved = self.apply_value(json, properties);
        serde_json::from_value(resolved)
    }

    fn apply_value(&self, value: Value, properties: &BTreeMap<String, String>) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(&s, properties)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.apply_value(item, properties))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        (self.substitute(&k, properties), self.apply_value(v, properties))
                    })
                    .collect(),
            ),
            other => other,
        }
    }
}

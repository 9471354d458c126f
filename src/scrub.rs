//! Sensitive-field scrubbing for event context
//!
//! Any object key whose lowercase name contains one of the configured field
//! names has its value replaced, at any depth.

use serde_json::Value;

pub const FILTERED: &str = "[FILTERED]";

#[derive(Debug, Clone)]
pub struct Scrubber {
    fields: Vec<String>,
}

impl Scrubber {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().trim().to_ascii_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.fields.iter().any(|field| key.contains(field.as_str()))
    }

    /// Scrub a value in place, returning how many values were replaced
    pub fn scrub(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => {
                let mut replaced = 0;
                for (key, entry) in map.iter_mut() {
                    if self.is_sensitive(key) {
                        *entry = Value::String(FILTERED.to_string());
                        replaced += 1;
                    } else {
                        replaced += self.scrub(entry);
                    }
                }
                replaced
            }
            Value::Array(items) => items.iter_mut().map(|item| self.scrub(item)).sum(),
            _ => 0,
        }
    }

    pub fn scrubbed(&self, mut value: Value) -> Value {
        self.scrub(&mut value);
        value
    }
}

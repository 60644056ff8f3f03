use serde::{Deserialize, Serialize};

/// Report delivery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmailConfig {
    /// Let the service use its own sender, recipients and API key
    pub use_env: bool,
    pub from: String,
    /// Comma-separated recipient list, passed through untouched
    pub to: String,
    /// SendGrid API key
    pub api_key: String,
}

/// Email fields as emitted on the wire; serializes to `{}` when empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailOverride {
    #[serde(rename = "email_from", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(rename = "email_to", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "email_key", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl EmailOverride {
    pub fn is_empty(&self) -> bool {
        self.from.is_none() && self.to.is_none() && self.api_key.is_none()
    }
}

impl EmailConfig {
    /// Derive the override payload. Values are copied verbatim; checking
    /// that they are present is the caller's job.
    pub fn resolve(&self) -> EmailOverride {
        if self.use_env {
            return EmailOverride::default();
        }

        EmailOverride {
            from: Some(self.from.clone()),
            to: Some(self.to.clone()),
            api_key: Some(self.api_key.clone()),
        }
    }
}

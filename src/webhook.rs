//! Webhook payload and push classification

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Maximum commit message length kept on a job; squashed commits can be huge.
pub const MAX_COMMIT_MSG_LEN: usize = 500;

/// The parts of a push payload the deploy pipeline cares about.
/// Every field is lenient: a missing or wrongly-typed value becomes `None`
/// so a malformed payload classifies instead of failing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "ref", default, deserialize_with = "lenient_string")]
    pub git_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub after: Option<String>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub repository: Option<Repository>,
    #[serde(default, deserialize_with = "lenient_object")]
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default, deserialize_with = "lenient_string")]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeadCommit {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_str().map(String::from)))
}

fn lenient_object<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .filter(Value::is_object)
        .and_then(|v| serde_json::from_value(v).ok()))
}

impl WebhookEvent {
    /// Parse a raw body. Only invalid JSON is an error; a body that is valid
    /// JSON but not an object yields an event with every field empty.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_slice(body)?;
        if !payload.is_object() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload)
    }

    pub fn repository_full_name(&self) -> Option<&str> {
        self.repository.as_ref()?.full_name.as_deref()
    }

    /// Head commit id, falling back to the `after` sha.
    pub fn commit_id(&self) -> Option<&str> {
        self.head_commit
            .as_ref()
            .and_then(|c| c.id.as_deref())
            .or(self.after.as_deref())
    }

    pub fn commit_message(&self) -> Option<&str> {
        self.head_commit.as_ref()?.message.as_deref()
    }
}

/// Outcome of classifying a verified push.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub should_deploy: bool,
    pub reason: String,
}

impl Classification {
    fn deploy(reason: String) -> Self {
        Self {
            should_deploy: true,
            reason,
        }
    }

    fn ignore(reason: String) -> Self {
        Self {
            should_deploy: false,
            reason,
        }
    }
}

/// Decide whether a push warrants a deploy.
///
/// Only pushes whose `ref` equals `release_ref` deploy. A missing ref, or a
/// repository other than `repository` when one is configured, is ignored.
pub fn classify_event(
    event: &WebhookEvent,
    release_ref: &str,
    repository: Option<&str>,
) -> Classification {
    let Some(git_ref) = event.git_ref.as_deref().filter(|r| !r.is_empty()) else {
        return Classification::ignore("payload has no ref".to_string());
    };

    if let Some(expected) = repository {
        match event.repository_full_name() {
            Some(name) if name == expected => {}
            other => {
                return Classification::ignore(format!(
                    "repository {:?} is not {}",
                    other, expected
                ));
            }
        }
    }

    if git_ref == release_ref {
        Classification::deploy(format!("push to {}", release_ref))
    } else {
        Classification::ignore(format!("{} is not {}", git_ref, release_ref))
    }
}

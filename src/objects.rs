//! Domain objects shared between the pool and the backend adapter.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Resource limits applied to an action container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: Option<u64>,
    /// CPU limit in millicores (1000 = 1 CPU core).
    pub cpu_millicores: Option<u64>,
}

/// A stored action revision the invoker can instantiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhiskAction {
    /// Fully qualified name, e.g. `namespace/package/action`.
    pub fqn: String,
    /// Document revision. A revision is never aliased with another.
    pub rev: String,
    /// Runtime image the action executes in, without registry or tag.
    pub image: String,
    /// Payload posted to the container's init endpoint after start.
    pub init_payload: serde_json::Value,
    #[serde(default)]
    pub limits: ActionLimits,
}

/// Credential identifying the subject an action runs as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKey {
    pub uuid: String,
    pub key: String,
}

impl AuthKey {
    /// Compact `uuid:key` form seeded into container environments.
    pub fn compact(&self) -> String {
        format!("{}:{}", self.uuid, self.key)
    }
}

/// Timestamped result of an in-container init call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Epoch millis when the call was issued.
    pub started_at: u64,
    /// Epoch millis when the response (or failure) was observed.
    pub ended_at: u64,
    /// Status code and combined output, when a response was received.
    /// Code 0 is success.
    pub response: Option<(i32, String)>,
}

impl RunResult {
    pub fn ok(&self) -> bool {
        matches!(self.response, Some((code, _)) if code == 0)
    }
}

/// Cache key identifying an interchangeable set of containers.
///
/// Construction is deterministic and injective over its inputs: distinct
/// (auth, action, revision) tuples never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey(String);

impl ActionKey {
    pub fn for_action(action: &WhiskAction, auth: &AuthKey) -> Self {
        ActionKey(format!(
            "instantiated.{}.{}.{}",
            auth.uuid, action.fqn, action.rev
        ))
    }

    pub fn for_image(image: &str, args: &[String]) -> Self {
        ActionKey(format!("instantiated.{}{}", image, args.join(" ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces unique, runtime-safe container names of the form
/// `wsk{instance}_{seq}_{sanitizedFqn}_{timestamp}`.
///
/// The `wsk` prefix marks containers owned by this worker; straggler
/// cleanup matches on it after an abnormal restart.
pub struct ContainerNamer {
    instance: u32,
    counter: AtomicU64,
}

impl ContainerNamer {
    pub const PREFIX: &'static str = "wsk";

    pub fn new(instance: u32) -> Self {
        Self {
            instance,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self, name_hint: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        format!(
            "{}{}_{}_{}_{}",
            Self::PREFIX,
            self.instance,
            seq,
            sanitize(name_hint),
            ts
        )
    }
}

/// Replace everything a container name cannot carry with underscores.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Current wall clock in epoch millis.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(fqn: &str, rev: &str) -> WhiskAction {
        WhiskAction {
            fqn: fqn.to_string(),
            rev: rev.to_string(),
            image: "nodejs".to_string(),
            init_payload: serde_json::json!({}),
            limits: ActionLimits::default(),
        }
    }

    fn auth(uuid: &str) -> AuthKey {
        AuthKey {
            uuid: uuid.to_string(),
            key: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_action_keys_are_deterministic_and_disjoint() {
        let a = ActionKey::for_action(&action("ns/echo", "1"), &auth("u1"));
        let b = ActionKey::for_action(&action("ns/echo", "1"), &auth("u1"));
        assert_eq!(a, b);

        assert_ne!(a, ActionKey::for_action(&action("ns/echo", "2"), &auth("u1")));
        assert_ne!(a, ActionKey::for_action(&action("ns/echo", "1"), &auth("u2")));
        assert_ne!(a, ActionKey::for_action(&action("ns/other", "1"), &auth("u1")));
    }

    #[test]
    fn test_image_key_includes_args() {
        let plain = ActionKey::for_image("whisk/skeleton", &[]);
        let with_args = ActionKey::for_image(
            "whisk/skeleton",
            &["--verbose".to_string(), "run".to_string()],
        );
        assert_eq!(plain.as_str(), "instantiated.whisk/skeleton");
        assert_eq!(with_args.as_str(), "instantiated.whisk/skeleton--verbose run");
    }

    #[test]
    fn test_namer_produces_unique_prefixed_names() {
        let namer = ContainerNamer::new(7);
        let first = namer.next("ns/echo@1.0");
        let second = namer.next("ns/echo@1.0");

        assert!(first.starts_with("wsk7_0_ns_echo_1_0_"));
        assert!(second.starts_with("wsk7_1_ns_echo_1_0_"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_auth_compact_form() {
        assert_eq!(auth("23bc46b1").compact(), "23bc46b1:s3cret");
    }

    #[test]
    fn test_run_result_ok() {
        let ok = RunResult {
            started_at: 1,
            ended_at: 2,
            response: Some((0, "ok".to_string())),
        };
        let failed = RunResult {
            started_at: 1,
            ended_at: 2,
            response: Some((502, "boom".to_string())),
        };
        let absent = RunResult {
            started_at: 1,
            ended_at: 2,
            response: None,
        };
        assert!(ok.ok());
        assert!(!failed.ok());
        assert!(!absent.ok());
    }
}

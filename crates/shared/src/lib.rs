pub mod error;
pub mod events;
pub mod message;
pub mod naming;

pub use error::ChatError;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    /// How to reach the inference backend
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BackendSettings {
        /// Use `remote_url` instead of a locally launched backend
        pub remote: bool,
        pub remote_url: String,
        /// Sent as `Authorization: Bearer` in remote mode when non-empty
        pub bearer_token: String,
        pub local_port: u16,
        /// Where the local backend keeps its models (`OLLAMA_MODELS`)
        pub model_directory: Option<PathBuf>,
        /// Explicit path to the backend executable; otherwise `ollama` on PATH
        pub binary: Option<PathBuf>,
        /// Minutes without activity before a local backend is stopped; 0 disables
        pub idle_timer_minutes: u64,
        /// Extra environment for the local backend process
        pub overrides: BTreeMap<String, String>,
    }

    impl BackendSettings {
        pub fn idle_timeout(&self) -> Option<Duration> {
            if self.idle_timer_minutes == 0 {
                None
            } else {
                Some(Duration::from_secs(self.idle_timer_minutes * 60))
            }
        }

        pub fn local_url(&self) -> String {
            format!("http://127.0.0.1:{}", self.local_port)
        }
    }

    impl Default for BackendSettings {
        fn default() -> Self {
            Self {
                remote: false,
                remote_url: "http://0.0.0.0:11434".into(),
                bearer_token: String::new(),
                local_port: 11435,
                model_directory: None,
                binary: None,
                idle_timer_minutes: 0,
                overrides: BTreeMap::new(),
            }
        }
    }

    /// Generation tuning sent with every chat request
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Tweaks {
        pub temperature: f32,
        /// 0 means "let the backend pick"
        pub seed: i64,
        pub keep_alive_minutes: u32,
    }

    impl Default for Tweaks {
        fn default() -> Self {
            Self {
                temperature: 0.7,
                seed: 0,
                keep_alive_minutes: 5,
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct AppSettings {
        pub backend: BackendSettings,
        pub tweaks: Tweaks,
        /// Model tag used for new turns, e.g. "llama3.2:3b"
        pub default_model: Option<String>,
        /// Name of the chat that was open when the app last closed
        pub selected_chat: Option<String>,
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    use crate::message::Role;

    /// A message as the backend expects it
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct WireMessage {
        pub role: Role,
        pub content: String,
        /// Base64-encoded images
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub images: Vec<String>,
    }

    impl WireMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: content.into(),
                images: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::agent_api::WireMessage;
    use super::message::Role;
    use super::settings::AppSettings;

    #[test]
    fn test_settings_fill_missing_fields() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"backend": {"local_port": 9000}, "tweaks": {"seed": 42}}"#)
                .unwrap();

        assert_eq!(settings.backend.local_port, 9000);
        assert_eq!(settings.backend.remote_url, "http://0.0.0.0:11434");
        assert_eq!(settings.tweaks.seed, 42);
        assert_eq!(settings.tweaks.keep_alive_minutes, 5);
        assert!(settings.backend.idle_timeout().is_none());
    }

    #[test]
    fn test_wire_message_omits_empty_images() {
        let json = serde_json::to_value(WireMessage::new(Role::User, "Hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "Hi"}));
    }
}

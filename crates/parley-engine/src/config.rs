use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const MIN_REQUEST_TIMEOUT_S: f64 = 5.0;
const MAX_REQUEST_TIMEOUT_S: f64 = 600.0;

pub const STORAGE_FILE_NAME: &str = "storage.json";
pub const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Environment lookup layered over a `.env` file. Non-empty process
/// variables win over file entries.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    dotenv: BTreeMap<String, String>,
    use_process: bool,
}

impl EnvSource {
    pub fn process() -> Self {
        Self {
            dotenv: BTreeMap::new(),
            use_process: true,
        }
    }

    pub fn with_dotenv(path: &Path) -> Self {
        Self {
            dotenv: parse_dotenv(path),
            use_process: true,
        }
    }

    /// Fixed set of values, ignoring the process environment.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            dotenv: pairs
                .iter()
                .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
                .collect(),
            use_process: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let from_process = if self.use_process {
            env::var(key).ok()
        } else {
            None
        };
        from_process
            .or_else(|| self.dotenv.get(key).cloned())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeminiSettings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub request_timeout_s: f64,
}

impl GeminiSettings {
    pub fn from_env(source: &EnvSource) -> Self {
        Self {
            api_key: source
                .get("GEMINI_API_KEY")
                .or_else(|| source.get("GOOGLE_API_KEY")),
            api_base: source
                .get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            request_timeout_s: request_timeout_seconds(source.get("PARLEY_REQUEST_TIMEOUT")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub events_path: PathBuf,
    pub provider: String,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub vision_model: Option<String>,
    pub gemini: GeminiSettings,
    pub tts_command: Option<String>,
    pub stt_command: Option<String>,
}

impl EngineConfig {
    /// Builds the configuration for a data directory, reading its `.env`.
    pub fn load(data_dir: Option<PathBuf>) -> Self {
        let process = EnvSource::process();
        let data_dir = data_dir.unwrap_or_else(|| default_data_dir(&process));
        let source = EnvSource::with_dotenv(&data_dir.join(".env"));
        Self::from_source(data_dir, &source)
    }

    pub fn from_source(data_dir: PathBuf, source: &EnvSource) -> Self {
        Self {
            events_path: data_dir.join(EVENTS_FILE_NAME),
            data_dir,
            provider: "gemini".to_string(),
            text_model: None,
            image_model: None,
            vision_model: None,
            gemini: GeminiSettings::from_env(source),
            tts_command: source.get("PARLEY_TTS_COMMAND"),
            stt_command: source.get("PARLEY_STT_COMMAND"),
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join(STORAGE_FILE_NAME)
    }
}

pub fn default_data_dir(source: &EnvSource) -> PathBuf {
    if let Some(home) = source.get("PARLEY_HOME") {
        return PathBuf::from(home);
    }
    dirs::data_dir()
        .map(|dir| dir.join("parley"))
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

fn request_timeout_seconds(raw: Option<String>) -> f64 {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| value.clamp(MIN_REQUEST_TIMEOUT_S, MAX_REQUEST_TIMEOUT_S))
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S)
}

pub fn parse_dotenv(path: &Path) -> BTreeMap<String, String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut vars = BTreeMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }
    vars
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_dotenv, EngineConfig, EnvSource, GeminiSettings};

    #[test]
    fn dotenv_handles_quotes_exports_and_comments() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(".env");
        std::fs::write(
            &path,
            "# keys\nexport GEMINI_API_KEY=\"abc\"\nGEMINI_API_BASE='http://local/'\nbroken\n=novalue\n",
        )?;
        let vars = parse_dotenv(&path);
        assert_eq!(vars.get("GEMINI_API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(
            vars.get("GEMINI_API_BASE").map(String::as_str),
            Some("http://local/")
        );
        assert_eq!(vars.len(), 2);
        Ok(())
    }

    #[test]
    fn gemini_settings_fall_back_to_google_key_and_clamp_timeout() {
        let source = EnvSource::from_pairs(&[
            ("GOOGLE_API_KEY", "g-key"),
            ("GEMINI_API_BASE", "http://127.0.0.1:9/v1/"),
            ("PARLEY_REQUEST_TIMEOUT", "2"),
        ]);
        let settings = GeminiSettings::from_env(&source);
        assert_eq!(settings.api_key.as_deref(), Some("g-key"));
        assert_eq!(settings.api_base, "http://127.0.0.1:9/v1");
        assert_eq!(settings.request_timeout_s, 5.0);

        let defaults = GeminiSettings::from_env(&EnvSource::from_pairs(&[
            ("GEMINI_API_KEY", "  "),
            ("PARLEY_REQUEST_TIMEOUT", "nope"),
        ]));
        assert_eq!(defaults.api_key, None);
        assert_eq!(defaults.request_timeout_s, 90.0);
        assert!(defaults.api_base.starts_with("https://"));
    }

    #[test]
    fn config_paths_live_in_data_dir() {
        let source = EnvSource::from_pairs(&[("PARLEY_TTS_COMMAND", "say")]);
        let config = EngineConfig::from_source(PathBuf::from("/tmp/parley"), &source);
        assert_eq!(config.storage_path(), PathBuf::from("/tmp/parley/storage.json"));
        assert_eq!(config.events_path, PathBuf::from("/tmp/parley/events.jsonl"));
        assert_eq!(config.tts_command.as_deref(), Some("say"));
        assert_eq!(config.stt_command, None);
        assert_eq!(config.provider, "gemini");
    }
}

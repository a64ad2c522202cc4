//! Configuration for hatch console sessions.

/// Main configuration structure.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Keybind configuration.
    pub keybinds: KeybindConfig,

    /// Graphical viewer configuration.
    pub viewer: ViewerConfig,

    /// Local SPICE proxy configuration.
    pub proxy: ProxyConfig,

    /// Daemon connection configuration.
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct KeybindConfig {
    /// First key of the detach sequence.
    /// Format: "Ctrl-a", "Ctrl-]", etc.
    pub detach_prefix: String,

    /// Second key of the detach sequence, matched case-insensitively.
    pub detach_key: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Viewer commands tried in order. `{uri}` in an argument is replaced
    /// with the proxy URI.
    pub candidates: Vec<ViewerCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ViewerCandidate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Which kind of local socket to expose to viewers.
    pub backend: ProxyBackendChoice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyBackendChoice {
    /// Unix socket where available, loopback TCP otherwise.
    #[default]
    Auto,
    Unix,
    Tcp,
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Daemon socket path. `HATCH_SOCKET` takes precedence when set.
    pub socket: Option<std::path::PathBuf>,
}

impl Default for KeybindConfig {
    fn default() -> Self {
        Self {
            detach_prefix: "Ctrl-a".to_string(),
            detach_key: "q".to_string(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                ViewerCandidate {
                    program: "remote-viewer".to_string(),
                    args: vec!["{uri}".to_string()],
                },
                ViewerCandidate {
                    program: "spicy".to_string(),
                    args: vec!["--uri={uri}".to_string()],
                },
            ],
        }
    }
}

impl KeybindConfig {
    /// Resolve the detach sequence into its `(prefix, key)` bytes.
    pub fn detach_bytes(&self) -> eyre::Result<(u8, u8)> {
        let prefix = Keybind::parse(&self.detach_prefix)?.to_byte()?;
        let key = Keybind::parse(&self.detach_key)?.to_byte()?;
        if prefix == key {
            eyre::bail!("detach prefix and key must differ: {}", self.detach_prefix);
        }
        Ok((prefix, key))
    }

    /// Human readable form of the detach sequence, e.g. `<ctrl>+a q`.
    pub fn describe(&self) -> eyre::Result<String> {
        let prefix = Keybind::parse(&self.detach_prefix)?;
        let key = Keybind::parse(&self.detach_key)?;
        Ok(format!("{} {}", prefix.describe(), key.describe()))
    }
}

impl ViewerCandidate {
    /// Arguments with `{uri}` substituted.
    #[must_use]
    pub fn args_for(&self, uri: &str) -> Vec<String> {
        self.args.iter().map(|a| a.replace("{uri}", uri)).collect()
    }
}

/// Returns the config file path: ~/.config/hatch/config.toml
#[must_use]
pub fn config_path() -> std::path::PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("~/.config"))
        .join("hatch")
        .join("config.toml")
}

/// Load configuration from default path, falling back to defaults if not found.
pub fn load() -> eyre::Result<Config> {
    load_from(&config_path())
}

/// Load configuration from `path`, falling back to defaults if it does not exist.
pub fn load_from(path: &std::path::Path) -> eyre::Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Parsed keybind representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keybind {
    Ctrl(char),
    Key(char),
}

impl Keybind {
    /// Parse a keybind string like "Ctrl-a" or "q".
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let s = s.trim();
        if let Some((modifier, key)) = s.split_once('-')
            && !modifier.is_empty()
        {
            let mut chars = key.chars();
            let key = chars
                .next()
                .ok_or_else(|| eyre::eyre!("Missing key in keybind: {s}"))?;
            if chars.next().is_some() {
                eyre::bail!("Invalid keybind format: {s}");
            }
            return match modifier.to_lowercase().as_str() {
                "ctrl" => Ok(Keybind::Ctrl(key.to_ascii_lowercase())),
                _ => eyre::bail!("Unknown modifier: {modifier}"),
            };
        }

        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(key), None) => Ok(Keybind::Key(key)),
            _ => eyre::bail!("Invalid keybind format: {s}"),
        }
    }

    /// The single byte a raw-mode terminal delivers for this key.
    pub fn to_byte(&self) -> eyre::Result<u8> {
        match self {
            Keybind::Ctrl(c) if c.is_ascii() => Ok((*c as u8) & 0x1f),
            Keybind::Key(c) if c.is_ascii() => Ok(*c as u8),
            Keybind::Ctrl(c) | Keybind::Key(c) => {
                eyre::bail!("keybind must be an ASCII key: {c}")
            }
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Keybind::Ctrl(c) => format!("<ctrl>+{c}"),
            Keybind::Key(c) => c.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keybind_parse_ctrl() {
        let kb = Keybind::parse("Ctrl-A").unwrap();
        assert_eq!(kb, Keybind::Ctrl('a'));
        assert_eq!(kb.to_byte().unwrap(), 0x01);
    }

    #[test]
    fn test_keybind_parse_plain() {
        let kb = Keybind::parse("q").unwrap();
        assert_eq!(kb, Keybind::Key('q'));
        assert_eq!(kb.to_byte().unwrap(), b'q');
    }

    #[test]
    fn test_keybind_ctrl_bracket() {
        // Ctrl-] is 0x1d, the telnet escape
        assert_eq!(Keybind::parse("Ctrl-]").unwrap().to_byte().unwrap(), 0x1d);
    }

    #[test]
    fn test_keybind_rejects_unknown_modifier() {
        assert!(Keybind::parse("Alt-e").is_err());
        assert!(Keybind::parse("Ctrl-").is_err());
        assert!(Keybind::parse("qq").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.keybinds.detach_bytes().unwrap(), (0x01, b'q'));
        assert_eq!(config.keybinds.describe().unwrap(), "<ctrl>+a q");
        assert_eq!(config.proxy.backend, ProxyBackendChoice::Auto);
        assert_eq!(config.viewer.candidates.len(), 2);
    }

    #[test]
    fn test_identical_detach_keys_rejected() {
        let keybinds = KeybindConfig {
            detach_prefix: "Ctrl-a".to_string(),
            detach_key: "\u{1}".to_string(),
        };
        assert!(keybinds.detach_bytes().is_err());
    }

    #[test]
    fn test_viewer_uri_substitution() {
        let spicy = &ViewerConfig::default().candidates[1];
        assert_eq!(
            spicy.args_for("spice://127.0.0.1:5900"),
            vec!["--uri=spice://127.0.0.1:5900".to_string()]
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            backend = "tcp"

            [keybinds]
            detach_key = "x"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.backend, ProxyBackendChoice::Tcp);
        assert_eq!(config.keybinds.detach_prefix, "Ctrl-a");
        assert_eq!(config.keybinds.detach_bytes().unwrap(), (0x01, b'x'));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = std::env::temp_dir().join("hatch-config-test-missing");
        let config = load_from(&dir.join("config.toml")).unwrap();
        assert_eq!(config.keybinds.detach_key, "q");
    }
}

//! Codec for the line-oriented `server.cfg` format.
//!
//! Loading always starts from the documented server defaults and overlays whatever the
//! file specifies, which is how the server itself treats missing keys. Path-bearing
//! entries (gamemodes, filterscripts, plugins) are held as absolute paths resolved
//! against the owning working directory and are re-relativized on write.
use regex::Regex;
use serde::{Serialize, Serializer, ser::SerializeMap};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Component, Path, PathBuf},
    sync::OnceLock,
};
use tracing::debug;

use crate::{
    constants::{CONFIG_FILE, FILTERSCRIPTS_DIR, GAMEMODES_DIR, PLUGINS_DIR},
    error::SupervisorError,
};

/// Key holding the ordered gamemode rotation.
pub const GAMEMODES_KEY: &str = "gamemodes";
/// Key holding filterscript paths.
pub const FILTERSCRIPTS_KEY: &str = "filterscripts";
/// Key holding plugin paths.
pub const PLUGINS_KEY: &str = "plugins";

const ARRAY_KEYS: &[&str] = &[PLUGINS_KEY, FILTERSCRIPTS_KEY];
const NUMBER_KEYS: &[&str] = &[
    "lanmode",
    "maxplayers",
    "port",
    "announce",
    "query",
    "chatlogging",
    "onfoot_rate",
    "incar_rate",
    "weapon_rate",
    "stream_distance",
    "stream_rate",
    "maxnpc",
];
const COMMENT_KEY: &str = "echo";
const GAMEMODE_PREFIX: &str = "gamemode";

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*([a-z0-9_]+)(?:\s+(.+?))?\s*$")
            .expect("config line pattern is valid")
    })
}

/// A single entry of the gamemode rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gamemode {
    /// Absolute path of the compiled script, without extension.
    pub path: PathBuf,
    /// How many rounds the gamemode runs before rotating.
    pub repeat: u32,
}

/// Typed value of a configuration key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CfgValue {
    /// Numeric scalar (ports, rates, boolean-as-number flags).
    Number(f64),
    /// Free-form scalar.
    Text(String),
    /// Whitespace-separated path list.
    Paths(Vec<PathBuf>),
    /// Gamemode rotation.
    Gamemodes(Vec<Gamemode>),
    /// Key present without a value.
    Unset,
}

impl fmt::Display for CfgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgValue::Number(n) => write!(f, "{n}"),
            CfgValue::Text(s) => f.write_str(s),
            CfgValue::Paths(paths) => {
                let joined: Vec<_> =
                    paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
                f.write_str(&joined.join(" "))
            }
            CfgValue::Gamemodes(list) => write!(f, "<{} gamemodes>", list.len()),
            CfgValue::Unset => Ok(()),
        }
    }
}

impl From<&str> for CfgValue {
    fn from(value: &str) -> Self {
        CfgValue::Text(value.to_string())
    }
}

impl From<String> for CfgValue {
    fn from(value: String) -> Self {
        CfgValue::Text(value)
    }
}

impl From<f64> for CfgValue {
    fn from(value: f64) -> Self {
        CfgValue::Number(value)
    }
}

impl From<u16> for CfgValue {
    fn from(value: u16) -> Self {
        CfgValue::Number(f64::from(value))
    }
}

impl From<u32> for CfgValue {
    fn from(value: u32) -> Self {
        CfgValue::Number(f64::from(value))
    }
}

impl From<Vec<PathBuf>> for CfgValue {
    fn from(value: Vec<PathBuf>) -> Self {
        CfgValue::Paths(value)
    }
}

impl From<Vec<Gamemode>> for CfgValue {
    fn from(value: Vec<Gamemode>) -> Self {
        CfgValue::Gamemodes(value)
    }
}

/// A line that did not match the `key [value...]` grammar and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// One-based line number.
    pub number: usize,
    /// The raw line as read.
    pub text: String,
}

/// Parsed server configuration with key order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    entries: Vec<(String, CfgValue)>,
}

impl Serialize for ServerConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl ServerConfig {
    /// The values the server assumes for every key missing from its config file.
    pub fn defaults() -> Self {
        let mut cfg = Self::default();
        cfg.set("lanmode", 0u16);
        cfg.set("rcon_password", "changeme");
        cfg.set("maxplayers", 50u16);
        cfg.set("port", 7777u16);
        cfg.set("hostname", "SA-MP 0.3 Server");
        cfg.set(GAMEMODES_KEY, CfgValue::Gamemodes(Vec::new()));
        cfg.set(FILTERSCRIPTS_KEY, CfgValue::Paths(Vec::new()));
        cfg.set("announce", 0u16);
        cfg.set("query", 1u16);
        cfg.set("chatlogging", 0u16);
        cfg.set("weburl", "www.sa-mp.com");
        cfg.set("onfoot_rate", 40u16);
        cfg.set("incar_rate", 40u16);
        cfg.set("weapon_rate", 40u16);
        cfg.set("stream_distance", 300.0);
        cfg.set("stream_rate", 1000u16);
        cfg.set("maxnpc", 0u16);
        cfg.set("logtimeformat", "[%H:%M:%S]");
        cfg.set("bind", "0.0.0.0");
        cfg.set(PLUGINS_KEY, CfgValue::Paths(Vec::new()));
        cfg
    }

    /// Returns true when `key` is part of the default key set.
    pub fn is_known_key(key: &str) -> bool {
        Self::defaults().contains_key(key)
    }

    /// Looks up a value by (case-insensitive) key.
    pub fn get(&self, key: &str) -> Option<&CfgValue> {
        let key = key.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Returns true when the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Assigns a value, keeping the key's position if it already exists.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<CfgValue>) {
        let key = key.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Iterates over entries in their current order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CfgValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The gamemode rotation.
    pub fn gamemodes(&self) -> &[Gamemode] {
        match self.get(GAMEMODES_KEY) {
            Some(CfgValue::Gamemodes(list)) => list,
            _ => &[],
        }
    }

    /// Resolved filterscript paths.
    pub fn filterscripts(&self) -> &[PathBuf] {
        self.paths(FILTERSCRIPTS_KEY)
    }

    /// Resolved plugin paths.
    pub fn plugins(&self) -> &[PathBuf] {
        self.paths(PLUGINS_KEY)
    }

    fn paths(&self, key: &str) -> &[PathBuf] {
        match self.get(key) {
            Some(CfgValue::Paths(list)) => list,
            _ => &[],
        }
    }

    /// The game port, if set to a valid port number.
    pub fn port(&self) -> Option<u16> {
        match self.get("port")? {
            CfgValue::Number(n) if n.fract() == 0.0 && (1.0..=65535.0).contains(n) => {
                Some(*n as u16)
            }
            CfgValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// The address the server binds to.
    pub fn bind(&self) -> Option<String> {
        self.scalar("bind")
    }

    /// The RCON password.
    pub fn rcon_password(&self) -> Option<String> {
        self.scalar("rcon_password")
    }

    fn scalar(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            CfgValue::Number(n) => Some(n.to_string()),
            CfgValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Parses config text, resolving paths against `dir`. Malformed lines are skipped.
    pub fn parse(text: &str, dir: &Path) -> Self {
        let (cfg, malformed) = Self::parse_with_diagnostics(text, dir);
        for line in &malformed {
            debug!("Skipping malformed config line {}: {:?}", line.number, line.text);
        }
        cfg
    }

    /// Parses config text and also reports every line that was skipped as malformed.
    pub fn parse_with_diagnostics(text: &str, dir: &Path) -> (Self, Vec<MalformedLine>) {
        let mut cfg = Self::defaults();
        let mut slots: BTreeMap<usize, Gamemode> = BTreeMap::new();
        let mut malformed = Vec::new();
        let gamemodes_dir = base_dir(dir, GAMEMODES_KEY);

        for (idx, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut reject = || {
                malformed.push(MalformedLine {
                    number: idx + 1,
                    text: raw.to_string(),
                })
            };

            let Some(caps) = line_pattern().captures(trimmed) else {
                reject();
                continue;
            };

            let key = caps[1].to_ascii_lowercase();
            if key == COMMENT_KEY {
                continue;
            }
            let value = caps.get(2).map(|m| m.as_str().trim());

            if key == GAMEMODES_KEY {
                reject();
                continue;
            }

            if let Some(slot) = gamemode_slot(&key) {
                match value.and_then(|v| parse_gamemode(v, &gamemodes_dir)) {
                    Some(gamemode) => {
                        slots.insert(slot, gamemode);
                    }
                    None => reject(),
                }
                continue;
            }

            let parsed = if ARRAY_KEYS.contains(&key.as_str()) {
                let base = base_dir(dir, &key);
                CfgValue::Paths(
                    value
                        .map(|v| {
                            v.split_whitespace()
                                .map(|p| resolve(&base, Path::new(p)))
                                .collect()
                        })
                        .unwrap_or_default(),
                )
            } else {
                match value {
                    Some(v) if NUMBER_KEYS.contains(&key.as_str()) => v
                        .parse::<f64>()
                        .map(CfgValue::Number)
                        .unwrap_or_else(|_| CfgValue::Text(v.to_string())),
                    Some(v) => CfgValue::Text(v.to_string()),
                    None => CfgValue::Unset,
                }
            };

            cfg.set(key, parsed);
        }

        if !slots.is_empty() {
            cfg.set(GAMEMODES_KEY, CfgValue::Gamemodes(slots.into_values().collect()));
        }

        (cfg, malformed)
    }

    /// Renders the config in `server.cfg` form with paths relative to `dir`.
    pub fn serialize(&self, dir: &Path) -> String {
        let mut output = String::new();

        for (key, value) in &self.entries {
            match value {
                CfgValue::Gamemodes(list) => {
                    let base = base_dir(dir, GAMEMODES_KEY);
                    for (idx, gamemode) in list.iter().enumerate() {
                        output.push_str(&format!(
                            "{GAMEMODE_PREFIX}{idx} {} {}\n",
                            display_relative(&base, &gamemode.path),
                            gamemode.repeat
                        ));
                    }
                }
                CfgValue::Paths(paths) => {
                    let base = base_dir(dir, key);
                    let joined: Vec<_> =
                        paths.iter().map(|p| display_relative(&base, p)).collect();
                    output.push_str(&format!("{key} {}\n", joined.join(" ")));
                }
                CfgValue::Unset => output.push_str(&format!("{key}\n")),
                scalar => output.push_str(&format!("{key} {scalar}\n")),
            }
        }

        output
    }

    /// Reads and parses `server.cfg` from the given working directory.
    pub fn load(dir: &Path) -> Result<Self, SupervisorError> {
        let path = dir.join(CONFIG_FILE);
        let text = fs::read_to_string(&path).map_err(|source| {
            SupervisorError::ConfigMissingOrUnreadable {
                path: path.clone(),
                source,
            }
        })?;
        Ok(Self::parse(&text, dir))
    }

    /// Serializes the config into `server.cfg` inside `dir`.
    pub fn write(&self, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(CONFIG_FILE), self.serialize(dir))
    }
}

fn gamemode_slot(key: &str) -> Option<usize> {
    let digits = key.strip_prefix(GAMEMODE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_gamemode(value: &str, base: &Path) -> Option<Gamemode> {
    let mut parts = value.split_whitespace();
    let name = parts.next()?;
    let repeat = parts
        .next()
        .and_then(|r| r.parse::<u32>().ok())
        .filter(|r| *r > 0)
        .unwrap_or(1);

    Some(Gamemode {
        path: resolve(base, Path::new(name)),
        repeat,
    })
}

fn base_dir(dir: &Path, key: &str) -> PathBuf {
    match key {
        GAMEMODES_KEY => dir.join(GAMEMODES_DIR),
        FILTERSCRIPTS_KEY => dir.join(FILTERSCRIPTS_DIR),
        PLUGINS_KEY => dir.join(PLUGINS_DIR),
        _ => dir.to_path_buf(),
    }
}

fn display_relative(base: &Path, path: &Path) -> String {
    relative(base, &resolve(base, path))
        .to_string_lossy()
        .into_owned()
}

/// Joins `path` onto `base` (absolute paths win) and normalizes the result lexically.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    normalize(&base.join(path))
}

/// Removes `.` components and folds `..` into its parent without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Computes the path of `to` relative to the directory `from`.
pub fn relative(from: &Path, to: &Path) -> PathBuf {
    let from = normalize(from);
    let to = normalize(to);
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in to.iter().skip(common) {
        out.push(component.as_os_str());
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

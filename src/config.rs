use chrono::{DateTime, Local};
use log::{debug, info};
use thiserror::Error;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".pyrecorder.conf";
const DEFAULT_SUFFIX: &str = "mp3";
const TIMESTAMP_FORMAT: &str = "%Y_%m_%d-%H_%M";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config file {0}")]
    Missing(PathBuf),

    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("section [global] needs a savedir")]
    MissingSavedir,

    #[error("section {section} needs an url")]
    MissingUrl { section: String },

    #[error("radio station {0} is not found in config file")]
    UnknownStation(String),

    #[error("cannot determine the home directory")]
    NoHome,
}

/**
 * One radio station from the config file.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub name: String,
    pub fullname: String,
    pub suffix: String,
    pub url: String,
}

/**
 * The parsed config file: where recordings go and which stations exist.
 *
 * ```text
 * [global]
 * savedir = "/srv/radio"
 *
 * [fm4]
 * fullname = FM4
 * url = "https://orf-live.ors-shoutcast.at/fm4-q2a"
 * suffix = mp3
 * ```
 */
#[derive(Debug, Clone)]
pub struct Config {
    pub savedir: PathBuf,
    stations: HashMap<String, Station>,
}

impl Config {
    /** `~/.pyrecorder.conf` */
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoHome)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        debug!("Reading config file {}", path.display());
        let config = Self::parse(&fs::read_to_string(path)?)?;
        info!(
            "Loaded {} station(s) from {}",
            config.stations.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let sections = parse_sections(text)?;

        let savedir = sections
            .iter()
            .find(|(name, _)| name == "global")
            .and_then(|(_, values)| values.get("savedir"))
            .map(|dir| PathBuf::from(strip_quotes(dir)))
            .ok_or(ConfigError::MissingSavedir)?;

        let mut stations = HashMap::new();
        for (section, mut values) in sections.into_iter().filter(|(name, _)| name != "global") {
            let url = values
                .remove("url")
                .map(|url| strip_quotes(&url).to_string())
                .ok_or_else(|| ConfigError::MissingUrl {
                    section: section.clone(),
                })?;
            let station = Station {
                fullname: values.remove("fullname").unwrap_or_else(|| section.clone()),
                suffix: values
                    .remove("suffix")
                    .unwrap_or_else(|| DEFAULT_SUFFIX.to_string()),
                url,
                name: section.clone(),
            };
            stations.insert(section, station);
        }

        Ok(Config { savedir, stations })
    }

    pub fn station(&self, name: &str) -> Result<&Station, ConfigError> {
        self.stations
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStation(name.to_string()))
    }
}

/**
 * Splits INI text into sections in file order. Keys before the first
 * header, or a line that is neither a header nor a key/value pair, are
 * syntax errors. A repeated section is merged into the first one.
 */
fn parse_sections(text: &str) -> Result<Vec<(String, HashMap<String, String>)>, ConfigError> {
    let mut sections: Vec<(String, HashMap<String, String>)> = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| ConfigError::Syntax {
                    line: index + 1,
                    message: format!("bad section header {}", line),
                })?;
            if !sections.iter().any(|(existing, _)| existing == name) {
                sections.push((name.to_string(), HashMap::new()));
            }
            continue;
        }

        let split = line.find(|c: char| c == '=' || c == ':');
        let (key, value) = match split {
            Some(at) => (line[..at].trim(), line[at + 1..].trim()),
            None => {
                return Err(ConfigError::Syntax {
                    line: index + 1,
                    message: format!("expected key = value, got {}", line),
                })
            }
        };
        let section = sections.last_mut().ok_or_else(|| ConfigError::Syntax {
            line: index + 1,
            message: "key outside of any section".to_string(),
        })?;
        // Keys are case-insensitive, values are kept verbatim.
        section.1.insert(key.to_lowercase(), value.to_string());
    }

    Ok(sections)
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches('"')
}

/** `savedir/radio/show` */
pub fn recording_dir(savedir: &Path, radio: &str, show: &str) -> PathBuf {
    savedir.join(radio).join(show)
}

/** `savedir/radio/show/show_YYYY_MM_DD-HH_MM.suffix` */
pub fn recording_path(
    savedir: &Path,
    radio: &str,
    show: &str,
    suffix: &str,
    at: DateTime<Local>,
) -> PathBuf {
    recording_dir(savedir, radio, show).join(format!(
        "{}_{}.{}",
        show,
        at.format(TIMESTAMP_FORMAT),
        suffix
    ))
}

pub fn prepare_directory(dir: &Path) -> Result<(), ConfigError> {
    info!("Preparing directory: {}", dir.display());
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"
# recordings
[global]
savedir = "/srv/radio"

[fm4]
fullname = FM4
url = "https://orf-live.ors-shoutcast.at/fm4-q2a"

[oe1]
URL: http://example.org/oe1.aac
suffix: aac
"#;

    #[test]
    fn test_parse_global_and_stations() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.savedir, PathBuf::from("/srv/radio"));

        let fm4 = config.station("fm4").unwrap();
        assert_eq!(fm4.fullname, "FM4");
        assert_eq!(fm4.url, "https://orf-live.ors-shoutcast.at/fm4-q2a");
        assert_eq!(fm4.suffix, "mp3");
    }

    #[test]
    fn test_fullname_defaults_to_section_name() {
        let config = Config::parse(SAMPLE).unwrap();
        let oe1 = config.station("oe1").unwrap();
        assert_eq!(oe1.fullname, "oe1");
        assert_eq!(oe1.suffix, "aac");
        assert_eq!(oe1.url, "http://example.org/oe1.aac");
    }

    #[test]
    fn test_unknown_station() {
        let config = Config::parse(SAMPLE).unwrap();
        assert!(matches!(
            config.station("global"),
            Err(ConfigError::UnknownStation(_))
        ));
        assert!(matches!(
            config.station("bbc"),
            Err(ConfigError::UnknownStation(name)) if name == "bbc"
        ));
    }

    #[test]
    fn test_missing_url_names_section() {
        let text = "[global]\nsavedir = /tmp\n[silent]\nfullname = Nothing\n";
        match Config::parse(text) {
            Err(ConfigError::MissingUrl { section }) => assert_eq!(section, "silent"),
            other => panic!("expected MissingUrl, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_savedir() {
        let text = "[fm4]\nurl = http://example.org/fm4\n";
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::MissingSavedir)
        ));
    }

    #[test]
    fn test_syntax_errors_report_line() {
        let text = "[global]\nsavedir = /tmp\nthis is not valid\n";
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::Syntax { line: 3, .. })
        ));
        assert!(matches!(
            Config::parse("savedir = /tmp\n"),
            Err(ConfigError::Syntax { line: 1, .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(matches!(Config::load(&path), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, SAMPLE).unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.station("fm4").is_ok());
    }

    #[test]
    fn test_recording_path_layout() {
        let at = Local.with_ymd_and_hms(2026, 10, 18, 7, 5, 0).unwrap();
        let path = recording_path(Path::new("/srv/radio"), "fm4", "morning", "mp3", at);
        assert_eq!(
            path,
            PathBuf::from("/srv/radio/fm4/morning/morning_2026_10_18-07_05.mp3")
        );
    }

    #[test]
    fn test_prepare_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = recording_dir(dir.path(), "fm4", "morning");
        prepare_directory(&target).unwrap();
        prepare_directory(&target).unwrap();
        assert!(target.is_dir());
    }
}

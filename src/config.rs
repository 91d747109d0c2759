#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_JOB_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_ARTIFACT_TTL_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";

/// Everything the download service needs at runtime, resolved from CLI
/// overrides, the process environment and the `.env` file (in that order).
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub download_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub max_concurrent_downloads: usize,
    pub job_ttl: Duration,
    pub artifact_ttl: Duration,
    pub sweep_interval: Duration,
    pub yt_dlp_bin: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed_secs = |key: &str, default: u64| {
        Duration::from_secs(
            lookup(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default),
        )
    };

    let download_dir = overrides
        .download_dir
        .or_else(|| lookup("DOWNLOAD_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("CLEANTUBE_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("CLEANTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let max_concurrent_downloads = lookup("MAX_CONCURRENT_DOWNLOADS")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS)
        .max(1);
    let yt_dlp_bin = lookup("YT_DLP_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_BIN));
    let cookies_file = lookup("YT_DLP_COOKIES").map(PathBuf::from);

    RuntimeSettings {
        download_dir,
        host,
        port,
        max_concurrent_downloads,
        job_ttl: parsed_secs("JOB_TTL_SECS", DEFAULT_JOB_TTL_SECS),
        artifact_ttl: parsed_secs("ARTIFACT_TTL_SECS", DEFAULT_ARTIFACT_TTL_SECS),
        sweep_interval: parsed_secs("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)
            .max(Duration::from_secs(1)),
        yt_dlp_bin,
        cookies_file,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn empty_file_yields_defaults() {
        let settings = settings_from("");
        assert_eq!(settings.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(
            settings.max_concurrent_downloads,
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        );
        assert_eq!(settings.job_ttl, Duration::from_secs(DEFAULT_JOB_TTL_SECS));
        assert_eq!(settings.yt_dlp_bin, PathBuf::from(DEFAULT_YT_DLP_BIN));
        assert!(settings.cookies_file.is_none());
    }

    #[test]
    fn reads_values_from_file() {
        let settings = settings_from(
            "DOWNLOAD_DIR=\"/srv/dl\"\nCLEANTUBE_PORT=\"4242\"\nMAX_CONCURRENT_DOWNLOADS=5\nJOB_TTL_SECS=10\nYT_DLP_COOKIES=/etc/cookies.txt\n",
        );
        assert_eq!(settings.download_dir, PathBuf::from("/srv/dl"));
        assert_eq!(settings.port, 4242);
        assert_eq!(settings.max_concurrent_downloads, 5);
        assert_eq!(settings.job_ttl, Duration::from_secs(10));
        assert_eq!(
            settings.cookies_file,
            Some(PathBuf::from("/etc/cookies.txt"))
        );
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let settings = settings_from("MAX_CONCURRENT_DOWNLOADS=0\n");
        assert_eq!(settings.max_concurrent_downloads, 1);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from("CLEANTUBE_PORT=\"nope\"\nARTIFACT_TTL_SECS=-4\n");
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(
            settings.artifact_ttl,
            Duration::from_secs(DEFAULT_ARTIFACT_TTL_SECS)
        );
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("DOWNLOAD_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            (key == "DOWNLOAD_DIR").then(|| "/env".to_string())
        });
        assert_eq!(settings.download_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOAD_DIR="/media"
            YT_DLP_BIN='/opt/yt-dlp'
            CLEANTUBE_HOST =  "0.0.0.0"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOAD_DIR").unwrap(), "/media");
        assert_eq!(vars.get("YT_DLP_BIN").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("CLEANTUBE_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut vars = HashMap::new();
        vars.insert("DOWNLOAD_DIR".to_string(), "/file-dl".to_string());
        vars.insert("CLEANTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("CLEANTUBE_PORT".to_string(), "7000".to_string());

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| (key == "CLEANTUBE_PORT").then(|| "8000".to_string()),
            RuntimeOverrides {
                download_dir: Some(PathBuf::from("/override-dl")),
                host: Some("override-host".into()),
                port: Some(9000),
                env_path: None,
            },
        );

        assert_eq!(settings.download_dir, PathBuf::from("/override-dl"));
        assert_eq!(settings.host, "override-host");
        assert_eq!(settings.port, 9000);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_HOST);
    }
}

use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/videoteca-env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_REMUX_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BUILD_RETRY: Duration = Duration::from_secs(300);
const THUMBNAILS_DIR: &str = "thumbnails";

/// Raw values read from the env-style config file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub videos_root: Option<PathBuf>,
    pub thumbnails_root: Option<PathBuf>,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub public_url: Option<String>,
    pub ffmpeg: Option<PathBuf>,
    pub remux_timeout_secs: Option<u64>,
    pub thumbnail_timeout_secs: Option<u64>,
    pub build_retry_secs: Option<u64>,
}

/// Values given on the command line or through the environment. They win
/// over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub videos_root: Option<PathBuf>,
    pub thumbnails_root: Option<PathBuf>,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub public_url: Option<String>,
    pub ffmpeg: Option<PathBuf>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub videos_root: PathBuf,
    pub thumbnails_root: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    /// Scheme, host and port prefixed to every URL in a listing.
    pub public_url: String,
    pub ffmpeg: PathBuf,
    pub remux_timeout: Duration,
    pub thumbnail_timeout: Duration,
    pub build_retry: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        let parse_secs = |value: &str| -> Result<u64> {
            value
                .parse()
                .with_context(|| format!("Parsing {key} from {}", path.display()))
        };
        match key.trim() {
            "VIDEOS_ROOT" => cfg.videos_root = Some(PathBuf::from(value)),
            "THUMBNAILS_ROOT" => cfg.thumbnails_root = Some(PathBuf::from(value)),
            "VIDEOTECA_HOST" => {
                let host = value
                    .parse()
                    .with_context(|| format!("Parsing VIDEOTECA_HOST from {}", path.display()))?;
                cfg.host = Some(host);
            }
            "VIDEOTECA_PORT" => {
                let port = value
                    .parse()
                    .with_context(|| format!("Parsing VIDEOTECA_PORT from {}", path.display()))?;
                cfg.port = Some(port);
            }
            "PUBLIC_URL" => cfg.public_url = Some(value.to_string()),
            "FFMPEG_PATH" => cfg.ffmpeg = Some(PathBuf::from(value)),
            "REMUX_TIMEOUT_SECS" => cfg.remux_timeout_secs = Some(parse_secs(value)?),
            "THUMBNAIL_TIMEOUT_SECS" => cfg.thumbnail_timeout_secs = Some(parse_secs(value)?),
            "BUILD_RETRY_SECS" => cfg.build_retry_secs = Some(parse_secs(value)?),
            _ => {}
        }
    }
    Ok(Some(cfg))
}

pub fn load_settings(config_path: &Path, overrides: Overrides) -> Result<Settings> {
    let cfg = read_env_config(config_path)?.unwrap_or_default();
    resolve_settings(cfg, overrides, detect_local_ip)
}

/// Merges file values, overrides and defaults. `local_ip` is only consulted
/// when no public URL is configured.
pub fn resolve_settings(
    cfg: EnvConfig,
    overrides: Overrides,
    local_ip: impl FnOnce() -> Option<IpAddr>,
) -> Result<Settings> {
    let videos_root = overrides
        .videos_root
        .or(cfg.videos_root)
        .ok_or_else(|| anyhow!("VIDEOS_ROOT not set; pass --videos-root or add it to the config"))?;
    let thumbnails_root = match overrides.thumbnails_root.or(cfg.thumbnails_root) {
        Some(path) => path,
        None => videos_root
            .parent()
            .map(|parent| parent.join(THUMBNAILS_DIR))
            .ok_or_else(|| {
                anyhow!(
                    "cannot derive THUMBNAILS_ROOT from {}; set it explicitly",
                    videos_root.display()
                )
            })?,
    };
    let host = overrides.host.or(cfg.host).unwrap_or(DEFAULT_HOST);
    let port = overrides.port.or(cfg.port).unwrap_or(DEFAULT_PORT);
    let public_url = match overrides.public_url.or(cfg.public_url) {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => {
            let advertised = local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "localhost".to_string());
            format!("http://{advertised}:{port}")
        }
    };
    let ffmpeg = overrides
        .ffmpeg
        .or(cfg.ffmpeg)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG));

    Ok(Settings {
        videos_root,
        thumbnails_root,
        host,
        port,
        public_url,
        ffmpeg,
        remux_timeout: cfg
            .remux_timeout_secs
            .map_or(DEFAULT_REMUX_TIMEOUT, Duration::from_secs),
        thumbnail_timeout: cfg
            .thumbnail_timeout_secs
            .map_or(DEFAULT_THUMBNAIL_TIMEOUT, Duration::from_secs),
        build_retry: cfg
            .build_retry_secs
            .map_or(DEFAULT_BUILD_RETRY, Duration::from_secs),
    })
}

/// First non-loopback IPv4 address of this machine, as seen by the routing
/// table. Connecting a UDP socket sends no packets.
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
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

    fn no_ip() -> Option<IpAddr> {
        None
    }

    #[test]
    fn read_env_config_extracts_values() {
        let cfg = make_config(
            "# videoteca\nVIDEOS_ROOT=\"/media/videos/categoria\"\nVIDEOTECA_PORT=\"4242\"\nREMUX_TIMEOUT_SECS=\"30\"\n",
        );
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.port, Some(4242));
        assert_eq!(parsed.remux_timeout_secs, Some(30));
        assert_eq!(
            parsed.videos_root,
            Some(PathBuf::from("/media/videos/categoria"))
        );
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("VIDEOTECA_PORT=\"abc\"\n");
        assert!(read_env_config(cfg.path()).is_err());
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let parsed = read_env_config(Path::new("/nonexistent/videoteca-env")).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn defaults_fill_missing_values() {
        let cfg = make_config("VIDEOS_ROOT=\"/m/videos/categoria\"\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        let settings = resolve_settings(parsed, Overrides::default(), no_ip).unwrap();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.thumbnails_root, PathBuf::from("/m/videos/thumbnails"));
        assert_eq!(settings.public_url, "http://localhost:3000");
        assert_eq!(settings.ffmpeg, PathBuf::from(DEFAULT_FFMPEG));
        assert_eq!(settings.remux_timeout, DEFAULT_REMUX_TIMEOUT);
        assert_eq!(settings.build_retry, DEFAULT_BUILD_RETRY);
    }

    #[test]
    fn overrides_win_over_file() {
        let cfg = EnvConfig {
            videos_root: Some(PathBuf::from("/file/videos")),
            port: Some(1111),
            public_url: Some("http://file.example".into()),
            ..EnvConfig::default()
        };
        let overrides = Overrides {
            videos_root: Some(PathBuf::from("/cli/videos")),
            port: Some(2222),
            public_url: Some("https://cli.example/".into()),
            ..Overrides::default()
        };
        let settings = resolve_settings(cfg, overrides, no_ip).unwrap();
        assert_eq!(settings.videos_root, PathBuf::from("/cli/videos"));
        assert_eq!(settings.port, 2222);
        assert_eq!(settings.public_url, "https://cli.example");
    }

    #[test]
    fn detected_ip_is_advertised() {
        let cfg = EnvConfig {
            videos_root: Some(PathBuf::from("/v/categoria")),
            ..EnvConfig::default()
        };
        let settings = resolve_settings(cfg, Overrides::default(), || {
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 6)))
        })
        .unwrap();
        assert_eq!(settings.public_url, "http://192.168.1.6:3000");
    }

    #[test]
    fn videos_root_is_required() {
        assert!(resolve_settings(EnvConfig::default(), Overrides::default(), no_ip).is_err());
    }
}

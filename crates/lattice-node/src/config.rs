//! Config file management for the node binary.
//!
//! The node reads one TOML file at `~/.config/lattice/config.toml`
//! (XDG layout); the file path resolves CLI flag > `LATTICE_CONFIG`
//! env var > default path. Individual keys then resolve
//! `LATTICE_<SECTION>_<KEY>` env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use lattice_core::config::CoreConfig;

/// Return the lattice config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/lattice` or
/// `~/.config/lattice`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("lattice");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("lattice")
}

/// Return the default config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Resolve the config file path: CLI flag > env var > default.
pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
    if let Some(path) = cli_path {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("LATTICE_CONFIG") {
        return PathBuf::from(path);
    }
    config_path()
}

/// Load the node config, falling back to defaults when no file exists
/// at the default location (an explicitly named file must exist), then
/// apply per-key `LATTICE_` environment overrides.
pub fn load(cli_path: Option<&str>) -> Result<CoreConfig> {
    let path = resolve_path(cli_path);

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        CoreConfig::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?
    } else {
        if cli_path.is_some() || std::env::var("LATTICE_CONFIG").is_ok() {
            bail!("config file not found at {}", path.display());
        }
        tracing::info!("no config file, using defaults");
        CoreConfig::default()
    };

    config
        .apply_env_overrides()
        .context("invalid LATTICE_ environment override")?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (the file holds the cookie).
pub fn save(path: &PathBuf, config: &CoreConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random cluster cookie: 32 random bytes, hex-encoded.
pub fn generate_cookie() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

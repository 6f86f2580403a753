//! Command-line argument parsing.

use clap::Parser;

/// Convoy daemon - volume, snapshot and backup orchestration
#[derive(Parser, Debug, Default)]
#[command(name = "convoy-daemon")]
#[command(about = "Convoy daemon - volume, snapshot and backup orchestration")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Root directory for daemon and driver metadata
    #[arg(long, env = "CONVOY_ROOT")]
    pub root: Option<String>,

    /// Listen address for the HTTP API
    #[arg(long)]
    pub listen: Option<String>,

    /// Driver to load; repeat for several, the first one is the default
    #[arg(long = "driver")]
    pub drivers: Vec<String>,

    /// Driver option as key=value (e.g. vfs.path=/opt/convoy)
    #[arg(long = "driver-opt", value_parser = parse_key_val)]
    pub driver_opts: Vec<(String, String)>,

    /// Mount namespace file to run mount commands in (e.g. /proc/1/ns/mnt)
    #[arg(long)]
    pub mnt_ns: Option<String>,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid driver option {:?}, expected key=value", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_driver_options() {
        let args = Args::parse_from([
            "convoy-daemon",
            "--driver",
            "vfs",
            "--driver",
            "nfs",
            "--driver-opt",
            "vfs.path=/opt/convoy",
            "--driver-opt",
            "nfs.defaultmountoptions=vers=4",
        ]);
        assert_eq!(args.drivers, vec!["vfs", "nfs"]);
        assert_eq!(args.driver_opts[0], ("vfs.path".to_string(), "/opt/convoy".to_string()));
        assert_eq!(args.driver_opts[1].1, "vers=4");
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_reject_malformed_driver_option() {
        assert!(Args::try_parse_from(["convoy-daemon", "--driver-opt", "novalue"]).is_err());
        assert!(Args::try_parse_from(["convoy-daemon", "--driver-opt", "=x"]).is_err());
    }
}

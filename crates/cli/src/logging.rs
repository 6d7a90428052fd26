use itertools::Itertools;
use ki_bootstrap::paths::LogConfFile;
use tracing_subscriber::EnvFilter;

const ENV_VAR: &str = "KI_LOG";
const DEFAULT_DIRECTIVES: &str = "info";

/// Log to stderr, filtered by `KI_LOG`, else by the directives in `conf_file`, else at `info`.
pub fn configure_logging(conf_file: &LogConfFile) {
    let directives = std::env::var(ENV_VAR)
        .ok()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| conf_file.read_to_string().ok().map(|conf| parse_directives(&conf)))
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_owned());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(EnvFilter::new(directives))
        .init();
}

/// One directive per line. Blank lines and `#` comments are ignored.
fn parse_directives(conf: &str) -> String {
    conf.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .join(",")
}

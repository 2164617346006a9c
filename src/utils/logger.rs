use env_logger::{Builder, Env, Target};

/// Logs go to stderr; stdout carries the single plugin line read by Icinga.
pub fn setup_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "error" };
    Builder::from_env(Env::default().default_filter_or(default_level))
        .target(Target::Stderr)
        .format_timestamp(None)
        .init();
}

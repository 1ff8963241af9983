//! Configuration from the command line and environment

use std::str::FromStr;

use tracing::debug;

use super::types::{Config, ResolveStrategy};
use crate::error::ConfigError;

/// Override the listening port
pub const ENV_PORT: &str = "REDIR_PORT";

/// Override the log level
pub const ENV_LOG_LEVEL: &str = "REDIR_LOG_LEVEL";

/// Override the resolution strategy
pub const ENV_STRATEGY: &str = "REDIR_STRATEGY";

/// Override the idle timeout (seconds)
pub const ENV_IDLE_TIMEOUT: &str = "REDIR_IDLE_TIMEOUT";

/// Build a configuration from command-line arguments (program name excluded).
///
/// The only required argument is the positional listening port. Options may
/// appear before or after it.
///
/// # Errors
///
/// Returns `ConfigError` for unknown flags, missing or unparseable values,
/// and if the resulting configuration fails validation.
pub fn parse_args<I, S>(args: I) -> Result<Config, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut config = Config::default();
    let mut port: Option<u16> = None;
    let mut args = args.into_iter().map(Into::into);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--idle-timeout" => {
                config.forward.idle_timeout_ms = secs_to_ms(&arg, &value(&arg, args.next())?)?;
            }
            "--write-timeout" => {
                config.forward.write_timeout_ms = secs_to_ms(&arg, &value(&arg, args.next())?)?;
            }
            "--connect-timeout" => {
                config.forward.connect_timeout_ms = secs_to_ms(&arg, &value(&arg, args.next())?)?;
            }
            "--strategy" => {
                config.forward.strategy = value(&arg, args.next())?.parse()?;
            }
            "--buffer-size" => {
                config.forward.buffer_size = parse_num(&arg, &value(&arg, args.next())?)?;
            }
            "--pool-capacity" => {
                config.forward.pool_capacity = parse_num(&arg, &value(&arg, args.next())?)?;
            }
            "--backlog" => {
                config.listen.backlog = parse_num(&arg, &value(&arg, args.next())?)?;
            }
            "--no-transparent" => {
                config.listen.transparent = false;
            }
            "--log-level" => {
                config.log.level = value(&arg, args.next())?;
            }
            "--log-format" => {
                config.log.format = value(&arg, args.next())?;
            }
            flag if flag.starts_with('-') => {
                return Err(ConfigError::UnknownArgument(flag.to_string()));
            }
            positional => {
                if port.is_some() {
                    return Err(ConfigError::UnknownArgument(positional.to_string()));
                }
                port = Some(parse_num("port", positional)?);
            }
        }
    }

    config.listen.port = port.ok_or_else(|| ConfigError::MissingArgument("<PORT>".into()))?;
    config.validate()?;

    Ok(config)
}

/// Apply `REDIR_*` environment overrides and re-validate.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` if a variable holds an invalid value.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides_with(config, |name| std::env::var(name).ok())
}

fn apply_overrides_with<F>(config: &mut Config, get: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = get(ENV_PORT) {
        config.listen.port = port.parse().map_err(|_| env_error(ENV_PORT, &port))?;
        debug!("Listen port overridden to {}", config.listen.port);
    }

    if let Some(level) = get(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(strategy) = get(ENV_STRATEGY) {
        config.forward.strategy = ResolveStrategy::from_str(&strategy)
            .map_err(|_| env_error(ENV_STRATEGY, &strategy))?;
        debug!("Resolve strategy overridden to {}", config.forward.strategy);
    }

    if let Some(secs) = get(ENV_IDLE_TIMEOUT) {
        config.forward.idle_timeout_ms =
            secs_to_ms(ENV_IDLE_TIMEOUT, &secs).map_err(|_| env_error(ENV_IDLE_TIMEOUT, &secs))?;
        debug!("Idle timeout overridden to {}ms", config.forward.idle_timeout_ms);
    }

    config.validate()
}

fn value(flag: &str, next: Option<String>) -> Result<String, ConfigError> {
    next.ok_or_else(|| ConfigError::MissingArgument(format!("value for {flag}")))
}

fn parse_num<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::invalid(name, raw))
}

fn secs_to_ms(name: &str, raw: &str) -> Result<u64, ConfigError> {
    let secs: u64 = parse_num(name, raw)?;
    secs.checked_mul(1000)
        .ok_or_else(|| ConfigError::invalid(name, raw))
}

fn env_error(name: &str, value: &str) -> ConfigError {
    ConfigError::EnvError {
        name: name.into(),
        reason: format!("invalid value: {value}"),
    }
}

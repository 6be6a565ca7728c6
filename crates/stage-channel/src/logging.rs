//! Tracing setup for processes embedding the control channel.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the log filter from the environment.
///
/// `RUST_LOG` wins if set; otherwise `STAGE_LOG` picks the level for this
/// crate (`debug`, `warn`, `error`, default `info`).
pub fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = match std::env::var("STAGE_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => "info",
    };
    EnvFilter::new(format!("stage_channel={level}"))
}

/// Install a stderr subscriber. `LOG_FORMAT=json` switches to JSON lines.
///
/// A subscriber that is already installed is left in place.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
        tracing::debug!("still logging");
    }
}

use tracing_subscriber::{fmt, layer::SubscriberExt};

/// Start logging to console and, optionally, a file. Filtering comes from
/// `RUST_LOG` via the standard env filter.
pub fn init(
    log_file: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let writer = std::sync::Mutex::new(file);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer().with_ansi(!cfg!(windows)).with_target(false);

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)?;

    if let Ok(var) = std::env::var("RUST_LOG") {
        tracing::debug!("logging initiated with RUST_LOG=\"{var}\"");
    }
    Ok(())
}

//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, fmt::Write as _, io::IsTerminal, sync::Once};

use tracing_subscriber::{
    EnvFilter,
    filter::{Directive, LevelFilter},
};

static HOLDINGS_LOG_ENV_VAR: &str = "HOLDINGS_LOG";

/// Default level applied to workspace crates when `HOLDINGS_LOG` is unset.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Tests call this from many places, only the first call installs the subscriber.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        // `try_init` so a subscriber installed by the embedding process wins.
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .try_init()
            .is_ok();

        if installed {
            tracing::info!("log level: {}", log_level);
        }
    });
}

/// List of crates in the workspace.
const HOLDINGS_CRATES: &[&str] = &["holdings_config", "holdings_db", "monitoring"];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let log_level =
        std::env::var(HOLDINGS_LOG_ENV_VAR).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    // Invalid RUST_LOG directives are skipped rather than aborting the process.
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    for crate_name in HOLDINGS_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        // An unparsable HOLDINGS_LOG value falls back to the default level.
        let directive: Result<Directive, _> = format!("{crate_name}={log_level}")
            .parse()
            .or_else(|_| format!("{crate_name}={DEFAULT_LOG_LEVEL}").parse());
        if let Ok(directive) = directive {
            env_filter = env_filter.add_directive(directive);
        }
    }

    (env_filter, log_level)
}

/// Renders the `source()` chain of an error for the `error_source` log field.
///
/// The top-level message is already logged through `error = %err`, so only the causes are
/// rendered, joined by `: `. Returns an empty string for errors without a source.
pub fn error_source(err: &dyn Error) -> String {
    let mut rendered = String::new();
    let mut source = err.source();
    while let Some(cause) = source {
        if !rendered.is_empty() {
            rendered.push_str(": ");
        }
        let _ = write!(rendered, "{cause}");
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct Layer {
        msg: &'static str,
        source: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl Error for Layer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn Error + 'static))
        }
    }

    #[test]
    fn error_source_renders_causes_only() {
        let err = Layer {
            msg: "failed to create partition",
            source: Some(Box::new(Layer {
                msg: "database error",
                source: Some(Box::new(Layer {
                    msg: "relation already exists",
                    source: None,
                })),
            })),
        };

        assert_eq!(
            error_source(&err),
            "database error: relation already exists"
        );
    }

    #[test]
    fn error_source_is_empty_without_cause() {
        let err = Layer {
            msg: "standalone",
            source: None,
        };

        assert_eq!(error_source(&err), "");
    }

    /// If this fails, just update the above `HOLDINGS_CRATES` to match reality.
    #[test]
    fn assert_holdings_crates() {
        use cargo_metadata::MetadataCommand;

        let cmd = MetadataCommand::new().exec().unwrap();
        let mut names: Vec<String> = cmd
            .workspace_packages()
            .into_iter()
            .map(|pkg| pkg.name.replace('-', "_"))
            .collect();
        names.sort();
        assert_eq!(names, HOLDINGS_CRATES);
    }
}

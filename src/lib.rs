pub mod embeddings;
pub mod loaders;
pub mod models;
pub mod trainers;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export common types
pub use embeddings::{ConceptTokens, EmbeddingGuard, InversionError};
pub use trainers::{load_config, train_from_config, Config, ProcessConfig};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// `RUST_LOG` still overrides the level chosen here
    pub fn init_logger(verbose: bool) {
        let level = if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, level)
            .parse_env("RUST_LOG")
            .init();
    }
}

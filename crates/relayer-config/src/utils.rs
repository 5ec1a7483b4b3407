// Copyright 2024 AION Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use config::{Config, File};
use std::path::{Path, PathBuf};

use super::*;

/// A helper function that will search for all config files in the given directory and return them as a vec
/// of the paths.
///
/// Supported file extensions are:
/// - `.toml`.
/// - `.json`.
pub fn search_config_files<P: AsRef<Path>>(
    base_dir: P,
) -> aion_relayer_utils::Result<Vec<PathBuf>> {
    // A pattern that covers all toml or json files in the config directory and subdirectories.
    let toml_pattern = format!("{}/**/*.toml", base_dir.as_ref().display());
    let json_pattern = format!("{}/**/*.json", base_dir.as_ref().display());
    tracing::trace!(
        "Loading config files from {} and {}",
        toml_pattern,
        json_pattern
    );
    let toml_files = glob::glob(&toml_pattern)?;
    let json_files = glob::glob(&json_pattern)?;
    toml_files
        .chain(json_files)
        .map(|v| v.map_err(aion_relayer_utils::Error::from))
        .collect()
}

/// Try to parse the [`AionRelayerConfig`] from the given config file(s).
pub fn parse_from_files(
    files: &[PathBuf],
) -> aion_relayer_utils::Result<AionRelayerConfig> {
    let mut builder = Config::builder();
    for config_file in files {
        tracing::trace!("Loading config file: {}", config_file.display());
        // get file extension
        let ext = config_file
            .extension()
            .map(|e| e.to_str().unwrap_or(""))
            .unwrap_or("");
        let format = match ext {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            _ => {
                tracing::warn!("Unknown file extension: {}", ext);
                continue;
            }
        };
        builder = builder
            .add_source(File::from(config_file.as_path()).format(format));
    }

    // also merge in the environment (with a prefix of AION).
    let builder = builder
        .add_source(config::Environment::with_prefix("AION").separator("_"));
    let cfg = builder.build()?;
    // and finally deserialize the config and post-process it
    let config: Result<
        AionRelayerConfig,
        serde_path_to_error::Error<config::ConfigError>,
    > = serde_path_to_error::deserialize(cfg);
    match config {
        Ok(c) => postloading_process(c),
        Err(e) => {
            tracing::error!("{}", e);
            Err(e.into())
        }
    }
}

/// Load the configuration files from the given directory.
///
/// Returns `Ok(AionRelayerConfig)` on success, or the error on failure.
///
/// # Arguments
///
/// * `path` - The directory that contains the configuration files
///
/// it is the same as using the [`search_config_files`] and
/// [`parse_from_files`] functions combined.
pub fn load<P: AsRef<Path>>(
    path: P,
) -> aion_relayer_utils::Result<AionRelayerConfig> {
    parse_from_files(&search_config_files(path)?)
}

/// The postloading_process exists to validate configuration and standardize
/// the format of the configuration
pub fn postloading_process(
    mut config: AionRelayerConfig,
) -> aion_relayer_utils::Result<AionRelayerConfig> {
    tracing::trace!("Checking configration sanity ...");

    // the executor counts active slots against this value, so it must
    // stay inside the range the admin endpoint promises.
    if config.queue.max_concurrent == 0 {
        tracing::warn!("queue.max-concurrent of 0 makes no progress, raising to 1");
        config.queue.max_concurrent = 1;
    }
    if config.queue.max_concurrent > MAX_CONCURRENT_LIMIT {
        tracing::warn!(
            "queue.max-concurrent {} is above the limit, clamping to {}",
            config.queue.max_concurrent,
            MAX_CONCURRENT_LIMIT
        );
        config.queue.max_concurrent = MAX_CONCURRENT_LIMIT;
    }

    if config.store.db_path.is_none() {
        tracing::warn!(
            "No store.db-path configured; submissions will be rejected with 503"
        );
    }
    if config.admin.password.is_none() {
        tracing::warn!(
            "No admin password configured; the concurrency endpoint is disabled"
        );
    }
    if config.evm.private_key.is_none() {
        tracing::warn!(
            "No gas-payer private key configured; a development key will be generated"
        );
    }

    tracing::trace!(
        "postloaded config: {}",
        serde_json::to_string_pretty(&config)?
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_concurrency_bounds() {
        let mut config = AionRelayerConfig::default();
        config.queue.max_concurrent = 0;
        let config = postloading_process(config).unwrap();
        assert_eq!(config.queue.max_concurrent, 1);

        let mut config = AionRelayerConfig::default();
        config.queue.max_concurrent = 64;
        let config = postloading_process(config).unwrap();
        assert_eq!(config.queue.max_concurrent, MAX_CONCURRENT_LIMIT);
    }

    #[test]
    fn verify_requires_contract_address() {
        let config = AionRelayerConfig::default();
        assert!(config.verify().is_err());

        let mut config = AionRelayerConfig::default();
        config.evm.escrow_contract =
            Some(ethereum_types::Address::repeat_byte(0xcc));
        assert!(config.verify().is_ok());
    }

    #[test]
    fn parses_config_from_toml_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("relayer.toml");
        std::fs::write(
            &config_path,
            r#"
port = 4000

[evm]
name = "localhost"
http-endpoint = "http://127.0.0.1:8545"
chain-id = 31337
escrow-contract = "0xcccccccccccccccccccccccccccccccccccccccc"

[queue]
max-concurrent = 5
"#,
        )
        .unwrap();
        let config = load(dir.path()).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.evm.chain_id, 31337);
        assert_eq!(config.queue.max_concurrent, 5);
        assert!(config.verify().is_ok());
    }
}

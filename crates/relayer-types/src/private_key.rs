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

use std::str::FromStr;

use ethereum_types::Secret;
use serde::Deserialize;

/// PrivateKey represents the gas-payer private key.
///
/// This is the relayer's own key; it pays the gas for submitted
/// transactions and is never the key that produced a transfer
/// authorization.
#[derive(Clone)]
pub struct PrivateKey(Secret);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the key material
        f.debug_tuple("PrivateKey").finish()
    }
}

impl From<Secret> for PrivateKey {
    fn from(secret: Secret) -> Self {
        PrivateKey(secret)
    }
}

impl PrivateKey {
    /// Returns the raw 32 bytes of the key.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// An all-zero key is not a usable secp256k1 scalar; callers treat it
    /// the same as a missing key.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

fn parse_secret<E: serde::de::Error>(value: &str) -> Result<Secret, E> {
    let maybe_hex = Secret::from_str(value);
    match maybe_hex {
        Ok(val) => Ok(val),
        Err(e) => Err(serde::de::Error::custom(format!(
            "{e}\n got a {} chars string but expected a 66 chars string (including the 0x prefix)",
            value.len()
        ))),
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVistor;
        impl<'de> serde::de::Visitor<'de> for PrivateKeyVistor {
            type Value = Secret;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string, an env var, or a file path containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.starts_with("0x") {
                    // hex value
                    parse_secret(value)
                } else if value.starts_with('$') {
                    // env
                    let var = value.strip_prefix('$').unwrap_or(value);
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading this env {var}: {e}",
                        ))
                    })?;
                    parse_secret(&val)
                } else if value.starts_with("file:") {
                    // Read the secret from the file path
                    let file_path =
                        value.strip_prefix("file:").unwrap_or(value);
                    let val =
                        std::fs::read_to_string(file_path).map_err(|e| {
                            serde::de::Error::custom(format!(
                                "error while reading file path {file_path}: {e}",
                            ))
                        })?;
                    parse_secret(val.trim())
                } else {
                    Err(serde::de::Error::custom(
                        "expected a 0x-prefixed hex string, $ENV_VAR, or file:<path>",
                    ))
                }
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVistor)?;
        Ok(Self(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        key: PrivateKey,
    }

    #[test]
    fn parses_raw_hex_key() {
        let json = r#"{"key":"0x000000000000000000000000000000000000000000000000000000000000002a"}"#;
        let w: Wrapper = serde_json::from_str(json).unwrap();
        assert_eq!(w.key.as_bytes()[31], 0x2a);
        assert!(!w.key.is_zero());
    }

    #[test]
    fn detects_all_zero_key() {
        let json = r#"{"key":"0x0000000000000000000000000000000000000000000000000000000000000000"}"#;
        let w: Wrapper = serde_json::from_str(json).unwrap();
        assert!(w.key.is_zero());
    }

    #[test]
    fn rejects_short_hex_key() {
        let json = r#"{"key":"0xdeadbeef"}"#;
        let res: Result<Wrapper, _> = serde_json::from_str(json);
        assert!(res.is_err());
    }

    #[test]
    fn rejects_unknown_forms() {
        let json = r#"{"key":"not hex at all"}"#;
        let res: Result<Wrapper, _> = serde_json::from_str(json);
        assert!(res.is_err());
    }

    #[test]
    fn reads_key_from_env() {
        std::env::set_var(
            "TEST_AION_GAS_PAYER_KEY",
            "0x1111111111111111111111111111111111111111111111111111111111111111",
        );
        let json = r#"{"key":"$TEST_AION_GAS_PAYER_KEY"}"#;
        let w: Wrapper = serde_json::from_str(json).unwrap();
        assert_eq!(w.key.as_bytes()[0], 0x11);
    }
}

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

//! Classification of execution errors into retryable and permanent.
//!
//! The classification is a single pure function over the recorded error
//! message, so both the executor and the retry scheduler apply identical
//! rules. Matching on message substrings is a pragmatic bridge; a future
//! transport can classify by structured code here without touching the
//! callers.

use aion_validator::{
    ERR_DEADLINE_EXPIRED, ERR_INVALID_SIGNATURE, ERR_LOCKOUT_ACTIVE,
    ERR_NONCE_USED_ON_CHAIN,
};

/// Transient infrastructure failures worth retrying with backoff.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "network error",
    "timeout",
    "connection refused",
    "nonce too low",
    "replacement transaction underpriced",
    "insufficient funds for gas",
];

/// Oracle read failures recorded by the validator all share this prefix.
const TRANSIENT_CHECK_PREFIX: &str = "Failed to check";

/// Whether a recorded execution error is worth retrying.
///
/// On-chain reverts are not: re-submitting the same authorization will
/// revert identically.
pub fn is_retryable_error(message: &str) -> bool {
    if message.starts_with(TRANSIENT_CHECK_PREFIX) {
        return true;
    }
    RETRYABLE_SUBSTRINGS.iter().any(|s| message.contains(s))
}

/// Whether a validation verdict contains a non-recoverable failure class:
/// an expired deadline, a nonce the contract already consumed, an invalid
/// signature, or an active withdrawal lockout.
pub fn is_permanent_validation_error(errors: &[String]) -> bool {
    const PERMANENT: &[&str] = &[
        ERR_DEADLINE_EXPIRED,
        ERR_NONCE_USED_ON_CHAIN,
        ERR_INVALID_SIGNATURE,
        ERR_LOCKOUT_ACTIVE,
    ];
    errors
        .iter()
        .any(|e| PERMANENT.iter().any(|p| e.contains(p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_transport_errors_are_retryable() {
        for msg in [
            "network error while calling eth_call",
            "request timeout after 30s",
            "connection refused (os error 111)",
            "nonce too low",
            "replacement transaction underpriced",
            "insufficient funds for gas * price + value",
            "Failed to check nonce: transport error",
            "Failed to check balance: transport error",
        ] {
            assert!(is_retryable_error(msg), "{msg} should be retryable");
        }
    }

    #[test]
    fn reverts_and_unknown_errors_are_not_retryable() {
        assert!(!is_retryable_error("Transaction reverted"));
        assert!(!is_retryable_error("Insufficient locked funds"));
        assert!(!is_retryable_error("execution reverted: bad signature"));
    }

    #[test]
    fn permanent_validation_classes_are_detected() {
        assert!(is_permanent_validation_error(&[
            "Deadline expired".to_string()
        ]));
        assert!(is_permanent_validation_error(&[
            "Nonce already used on-chain".to_string()
        ]));
        assert!(is_permanent_validation_error(&[
            "Invalid signature".to_string()
        ]));
        assert!(is_permanent_validation_error(&[
            "Sender is in withdrawal lockout period".to_string()
        ]));
        assert!(!is_permanent_validation_error(&[
            "Failed to check nonce: timeout".to_string()
        ]));
        assert!(!is_permanent_validation_error(&[
            "Insufficient locked funds".to_string()
        ]));
    }
}

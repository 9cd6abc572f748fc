//! # Key Staging
//!
//! Puts the right key material into neard's home before each spawn. While
//! voting, `node_key.json` is this host's private voter identity and no
//! `validator_key.json` may exist (neard must not sign). While validating,
//! `node_key.json` is the shared validator network identity and
//! `validator_key.json` is the shared consensus key.
//!
//! All writes go through a temp file in the destination directory followed
//! by an atomic rename, so a concurrent reader (or a crash) never observes
//! a half-written key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::settings::{Settings, NODE_KEY_FILE, VALIDATOR_KEY_FILE};

/// The JSON shape neard uses for every key file.
///
/// `account_id` is present in validator keys and absent in plain node
/// keys; the supervisor never interprets the key material itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub public_key: String,
    pub secret_key: String,
}

/// Reads and validates a key file. Used both to stage keys and to check
/// at startup that the configured keys are usable at all.
pub fn load_key(path: &Path) -> Result<KeyFile, KeyError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(KeyError::Unreadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw).map_err(|source| KeyError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `contents` to `path` atomically: temp file in the same
/// directory, then rename over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn stage_file(source: &Path, dest: &Path) -> Result<(), KeyError> {
    // Parse before copying so a corrupt source never reaches the home.
    let key = load_key(source)?;
    let contents = serde_json::to_vec_pretty(&key).expect("key file serializes");
    atomic_write(dest, &contents).map_err(|source| KeyError::Stage {
        path: dest.to_path_buf(),
        source,
    })
}

/// Stages the voter identity: `node_key.json` becomes this host's voter
/// node key, and any `validator_key.json` is removed so neard cannot sign.
pub fn stage_voter(settings: &Settings) -> Result<(), KeyError> {
    let node_key = settings.neard_home.join(NODE_KEY_FILE);
    stage_file(&settings.voter_node_key, &node_key)?;

    let validator_key = settings.neard_home.join(VALIDATOR_KEY_FILE);
    match std::fs::remove_file(&validator_key) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(KeyError::Stage {
            path: validator_key,
            source,
        }),
    }
}

/// Stages the validator identity: the shared validator node key becomes
/// `node_key.json` and the shared consensus key becomes
/// `validator_key.json`.
pub fn stage_validator(settings: &Settings) -> Result<(), KeyError> {
    stage_file(
        &settings.validator_node_key,
        &settings.neard_home.join(NODE_KEY_FILE),
    )?;
    stage_file(
        &settings.validator_key,
        &settings.neard_home.join(VALIDATOR_KEY_FILE),
    )
}

/// Path of the staged node key inside the home. Exposed for tests and
/// status reporting.
pub fn staged_node_key(settings: &Settings) -> PathBuf {
    settings.neard_home.join(NODE_KEY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_key(path: &Path, account_id: Option<&str>, public: &str) {
        let key = KeyFile {
            account_id: account_id.map(str::to_string),
            public_key: public.into(),
            secret_key: format!("ed25519:secret-{public}"),
        };
        std::fs::write(path, serde_json::to_vec(&key).unwrap()).unwrap();
    }

    fn test_settings(dir: &Path) -> Settings {
        let home = dir.join("home");
        std::fs::create_dir(&home).unwrap();
        Settings {
            node_id: "node0".into(),
            consul_url: "http://127.0.0.1:8500".into(),
            consul_token: None,
            exporter_address: "127.0.0.1:2233".parse().unwrap(),
            validator_network_addr: "127.0.0.1:24567".parse().unwrap(),
            voter_network_addr: "127.0.0.1:24568".parse().unwrap(),
            validator_key: dir.join("validator_key.json"),
            validator_node_key: dir.join("validator_node_key.json"),
            voter_node_key: dir.join("voter_node_key.json"),
            neard_home: home,
            neard_bootnodes: None,
            control_socket: dir.join("kneard.sock"),
            public_address: None,
            neard_binary: "neard".into(),
        }
    }

    // -- 1. Loading ---------------------------------------------------------

    #[test]
    fn load_rejects_malformed_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(&path, b"{\"public_key\": 42}").unwrap();
        assert!(matches!(
            load_key(&path),
            Err(KeyError::Malformed { .. })
        ));
    }

    #[test]
    fn load_distinguishes_missing_from_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_key(&dir.path().join("absent.json")),
            Err(KeyError::Missing { .. })
        ));
    }

    // -- 2. Voter staging ---------------------------------------------------

    #[test]
    fn voter_staging_installs_voter_key_and_removes_validator_key() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_key(&settings.voter_node_key, None, "ed25519:voter");
        // Leftover from a previous validating stint.
        write_key(
            &settings.neard_home.join(VALIDATOR_KEY_FILE),
            Some("kuutamo.pool"),
            "ed25519:validator",
        );

        stage_voter(&settings).unwrap();

        let staged = load_key(&settings.neard_home.join(NODE_KEY_FILE)).unwrap();
        assert_eq!(staged.public_key, "ed25519:voter");
        assert!(!settings.neard_home.join(VALIDATOR_KEY_FILE).exists());
    }

    #[test]
    fn voter_staging_is_idempotent_without_validator_key() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_key(&settings.voter_node_key, None, "ed25519:voter");

        stage_voter(&settings).unwrap();
        stage_voter(&settings).unwrap();
    }

    // -- 3. Validator staging ----------------------------------------------

    #[test]
    fn validator_staging_installs_both_keys_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        write_key(&settings.validator_node_key, None, "ed25519:shared-node");
        write_key(
            &settings.validator_key,
            Some("kuutamo.pool"),
            "ed25519:consensus",
        );

        stage_validator(&settings).unwrap();

        let node = load_key(&settings.neard_home.join(NODE_KEY_FILE)).unwrap();
        let validator = load_key(&settings.neard_home.join(VALIDATOR_KEY_FILE)).unwrap();
        assert_eq!(node, load_key(&settings.validator_node_key).unwrap());
        assert_eq!(validator, load_key(&settings.validator_key).unwrap());
        assert_eq!(validator.account_id.as_deref(), Some("kuutamo.pool"));
    }

    #[test]
    fn staging_fails_cleanly_on_corrupt_source() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        std::fs::write(&settings.voter_node_key, b"not json").unwrap();

        assert!(stage_voter(&settings).is_err());
        // Nothing half-written appears in the home.
        assert!(!settings.neard_home.join(NODE_KEY_FILE).exists());
    }

    // -- 4. Atomic writes ---------------------------------------------------

    #[test]
    fn atomic_write_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.json");
        atomic_write(&dest, b"{}").unwrap();
        atomic_write(&dest, b"{\"v\":2}").unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.json")]);
        assert_eq!(std::fs::read(&dest).unwrap(), b"{\"v\":2}");
    }
}

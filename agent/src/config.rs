//! Device-local state: the key pair and rendered tunnel configurations.
//!
//! The private key is generated here, stored with 0600 permissions, and never
//! leaves this file except inside a rendered [`InterfaceConfig`] headed for
//! the local tunnel driver.

use goconnect_shared::{
    ensure_dirs_exist,
    interface_config::{InterfaceConfig, ServerInfo},
    key::{Key, KeyPair},
    DeviceConfig, Error, IoErrorContext,
};
use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug)]
pub struct DataStore {
    path: PathBuf,
    contents: Contents,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum Contents {
    #[serde(rename = "1")]
    V1 {
        device_name: String,
        private_key: String,
    },
}

impl DataStore {
    pub fn get_path(data_dir: &Path, device_name: &str) -> PathBuf {
        data_dir.join(device_name).with_extension("json")
    }

    /// Open the device's datastore, creating it (and a fresh key pair) on
    /// first use.
    pub fn open_or_create(data_dir: &Path, device_name: &str) -> Result<Self, Error> {
        ensure_dirs_exist(&[data_dir])?;
        let path = Self::get_path(data_dir, device_name);

        match std::fs::read_to_string(&path) {
            Ok(json) => {
                goconnect_shared::warn_on_dangerous_mode(&path).with_path(&path)?;
                let contents = serde_json::from_str(&json)?;
                Ok(Self { path, contents })
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let contents = Contents::V1 {
                    device_name: device_name.to_string(),
                    private_key: Key::generate_private().to_base64(),
                };
                let mut file = OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(&path)
                    .with_path(&path)?;
                goconnect_shared::chmod(&file, 0o600).with_path(&path)?;
                file.write_all(serde_json::to_string_pretty(&contents)?.as_bytes())
                    .with_path(&path)?;
                log::info!("generated a new key pair for {}", device_name);
                Ok(Self { path, contents })
            },
            Err(e) => Err(e).with_path(&path).map_err(Error::from),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device_name(&self) -> &str {
        match &self.contents {
            Contents::V1 { device_name, .. } => device_name,
        }
    }

    pub fn keypair(&self) -> Result<KeyPair, Error> {
        let Contents::V1 { private_key, .. } = &self.contents;
        let key = Key::from_base64(private_key)
            .map_err(|_| anyhow!("stored private key is corrupt"))?;
        Ok(KeyPair::from_private(key))
    }

    /// Merge a server-produced device configuration with the local key and
    /// write the tunnel config file. Refuses configurations that arrive with
    /// a populated private key.
    pub fn render_interface_config(
        &self,
        config_dir: &Path,
        network_name: &str,
        device_config: &DeviceConfig,
        server: ServerInfo,
    ) -> Result<PathBuf, Error> {
        if device_config.interface.addresses.is_empty() {
            bail!("server produced a device configuration without an address");
        }
        let config =
            InterfaceConfig::assemble(network_name, device_config, &self.keypair()?, server)?;
        config.save(config_dir, network_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goconnect_shared::{InterfaceSection, PeerSection, DEFAULT_LISTEN_PORT};
    use std::os::unix::fs::PermissionsExt;

    fn server_info() -> ServerInfo {
        ServerInfo {
            public_key: KeyPair::generate().public.to_base64(),
            external_endpoint: "gc.example.com:51820".parse().unwrap(),
        }
    }

    fn device_config(private_key: &str) -> DeviceConfig {
        DeviceConfig {
            interface: InterfaceSection {
                private_key: private_key.to_string(),
                addresses: vec!["10.0.0.5/24".to_string()],
                dns: vec![],
                listen_port: DEFAULT_LISTEN_PORT,
            },
            peers: vec![PeerSection {
                public_key: KeyPair::generate().public.to_base64(),
                allowed_ips: "10.0.0.7/32".to_string(),
                endpoint: None,
                preshared_key: None,
            }],
        }
    }

    #[test]
    fn test_datastore_keypair_is_persistent() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;

        let store = DataStore::open_or_create(dir.path(), "laptop")?;
        let first = store.keypair()?;

        let mode = std::fs::metadata(store.path())?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        // Reopening yields the same key, not a fresh one.
        let reopened = DataStore::open_or_create(dir.path(), "laptop")?;
        assert_eq!(reopened.keypair()?.private, first.private);
        assert_eq!(reopened.device_name(), "laptop");
        Ok(())
    }

    #[test]
    fn test_render_injects_local_key() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = DataStore::open_or_create(dir.path(), "laptop")?;
        let config_dir = dir.path().join("configs");

        let path = store.render_interface_config(
            &config_dir,
            "ops",
            &device_config(""),
            server_info(),
        )?;
        let rendered = InterfaceConfig::from_file(path)?;
        assert_eq!(
            rendered.interface.private_key,
            store.keypair()?.private.to_base64()
        );
        Ok(())
    }

    #[test]
    fn test_render_refuses_server_supplied_private_key() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = DataStore::open_or_create(dir.path(), "laptop")?;

        let poisoned = device_config(&KeyPair::generate().private.to_base64());
        assert!(store
            .render_interface_config(dir.path(), "ops", &poisoned, server_info())
            .is_err());
        Ok(())
    }
}

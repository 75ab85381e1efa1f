use crate::{
    chmod, ensure_dirs_exist, key::KeyPair, DeviceConfig, Endpoint, Error, IoErrorContext,
    WrappedIoError,
};
use anyhow::{anyhow, bail};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

/// This struct contains everything the local tunnel driver needs to bring up
/// a network interface: the server-assembled view of the network plus the
/// device's own private key, which is injected here and nowhere else.
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    /// The information to bring up the interface.
    pub interface: InterfaceInfo,

    /// The necessary contact information for the server.
    pub server: ServerInfo,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceInfo {
    /// The network name (i.e. "ops")
    pub network_name: String,

    /// The device's internal IP address inside the network's CIDR prefix.
    pub address: Ipv4Net,

    /// WireGuard private key (base64). Device-local material.
    pub private_key: String,

    /// The local listen port.
    pub listen_port: Option<u16>,

    /// Resolvers pushed by the network, if any.
    pub dns: Vec<String>,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ServerInfo {
    /// The server's public key
    pub public_key: String,

    /// The external internet endpoint to reach the server.
    pub external_endpoint: Endpoint,
}

impl InterfaceConfig {
    /// Merge a server-produced [`DeviceConfig`] with the locally held key
    /// pair. Server output must arrive with an empty private-key slot; a
    /// populated one means something upstream is mishandling key material,
    /// and we refuse to touch it.
    pub fn assemble(
        network_name: &str,
        config: &DeviceConfig,
        keypair: &KeyPair,
        server: ServerInfo,
    ) -> Result<Self, Error> {
        if !config.interface.private_key.is_empty() {
            bail!("refusing a device configuration that arrived with a populated private key");
        }
        let address = config
            .interface
            .addresses
            .first()
            .ok_or_else(|| anyhow!("device configuration carries no interface address"))?
            .parse()?;

        Ok(Self {
            interface: InterfaceInfo {
                network_name: network_name.to_string(),
                address,
                private_key: keypair.private.to_base64(),
                listen_port: Some(config.interface.listen_port),
                dns: config.interface.dns.clone(),
            },
            server,
        })
    }

    /// Save a new config file, failing if it already exists.
    pub fn save_new(&self, path: impl AsRef<Path>, mode: u32) -> Result<(), WrappedIoError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .with_path(path)?;

        chmod(&file, mode).with_path(path)?;

        file.write_all(self.contents().as_bytes()).with_path(path)?;

        Ok(())
    }

    /// Overwrites the config file if it already exists.
    pub fn save(&self, config_dir: &Path, network_name: &str) -> Result<PathBuf, Error> {
        let path = Self::build_config_file_path(config_dir, network_name)?;
        let file = File::create(&path).with_path(&path)?;
        chmod(&file, 0o600).with_path(&path)?;
        (&file)
            .write_all(self.contents().as_bytes())
            .with_path(&path)?;

        Ok(path)
    }

    fn contents(&self) -> String {
        toml::to_string(self).unwrap()
    }

    /// A printable form with the private key blanked, for logs and
    /// diagnostics.
    pub fn redacted(&self) -> String {
        let mut copy = self.clone();
        copy.interface.private_key = "(hidden)".to_string();
        copy.contents()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        crate::warn_on_dangerous_mode(path.as_ref()).with_path(path.as_ref())?;
        Ok(toml::from_str(
            &std::fs::read_to_string(&path).with_path(path)?,
        )?)
    }

    pub fn get_path(config_dir: &Path, network_name: &str) -> PathBuf {
        config_dir.join(network_name).with_extension("conf")
    }

    fn build_config_file_path(
        config_dir: &Path,
        network_name: &str,
    ) -> Result<PathBuf, WrappedIoError> {
        ensure_dirs_exist(&[config_dir])?;
        Ok(Self::get_path(config_dir, network_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceConfig, InterfaceSection, PeerSection, DEFAULT_LISTEN_PORT};
    use std::os::unix::fs::PermissionsExt;

    fn device_config(private_key: &str) -> DeviceConfig {
        DeviceConfig {
            interface: InterfaceSection {
                private_key: private_key.to_string(),
                addresses: vec!["10.0.0.5/24".to_string()],
                dns: vec!["10.0.0.1".to_string()],
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

    fn server_info() -> ServerInfo {
        ServerInfo {
            public_key: KeyPair::generate().public.to_base64(),
            external_endpoint: "gc.example.com:51820".parse().unwrap(),
        }
    }

    #[test]
    fn test_assemble_injects_local_key() -> Result<(), Error> {
        let keypair = KeyPair::generate();
        let config = InterfaceConfig::assemble("ops", &device_config(""), &keypair, server_info())?;
        assert_eq!(config.interface.private_key, keypair.private.to_base64());
        assert_eq!(config.interface.address, "10.0.0.5/24".parse().unwrap());
        Ok(())
    }

    #[test]
    fn test_assemble_refuses_populated_private_key() {
        let keypair = KeyPair::generate();
        let poisoned = device_config(&keypair.private.to_base64());
        assert!(InterfaceConfig::assemble("ops", &poisoned, &keypair, server_info()).is_err());
    }

    #[test]
    fn test_save_new_roundtrip_with_0600() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ops.conf");

        let keypair = KeyPair::generate();
        let config = InterfaceConfig::assemble("ops", &device_config(""), &keypair, server_info())?;
        config.save_new(&path, 0o600)?;

        let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let reloaded = InterfaceConfig::from_file(&path)?;
        assert_eq!(reloaded.interface.private_key, keypair.private.to_base64());

        // A second save_new must refuse to clobber the existing file.
        assert!(config.save_new(&path, 0o600).is_err());
        Ok(())
    }

    #[test]
    fn test_redacted_hides_private_key() -> Result<(), Error> {
        let keypair = KeyPair::generate();
        let config = InterfaceConfig::assemble("ops", &device_config(""), &keypair, server_info())?;
        let redacted = config.redacted();
        assert!(!redacted.contains(&keypair.private.to_base64()));
        assert!(redacted.contains("(hidden)"));
        Ok(())
    }
}

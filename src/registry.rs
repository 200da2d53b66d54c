//! Host name -> backend
//!
//! The local disk is always present. Remote hosts are set up on first use
//! and cached, successful or not: a host that failed once keeps answering
//! with its `ErroringBackend` until `shutdown`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{info, warn};

use crate::backend::{Backend, ErroringBackend, LocalBackend, RemoteBackend};
use crate::config::ClientConfig;
use crate::error::Error;

pub struct Registry {
    config: ClientConfig,
    local: LocalBackend,
    remotes: HashMap<String, Box<dyn Backend>>,
}

fn open_remote(host: &str, config: &ClientConfig) -> Box<dyn Backend> {
    let ip: IpAddr = match host.parse() {
        Ok(ip) => ip,
        Err(_) => {
            let err = Error::InvalidAddress(host.to_string());
            warn!(host, "{err}");
            return Box::new(ErroringBackend::new(err.to_string()));
        }
    };
    match RemoteBackend::connect(ip, config.clone()) {
        Ok(backend) => {
            info!(host, home = %backend.home_dir().display(), "remote host ready");
            Box::new(backend)
        }
        Err(e) => {
            warn!(host, error = %e, "remote host unavailable");
            Box::new(ErroringBackend::new(e.to_string()))
        }
    }
}

impl Registry {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            local: LocalBackend::new(),
            remotes: HashMap::new(),
        }
    }

    /// `None` and `"localhost"` are the local disk; anything else must be
    /// an IP address.
    pub fn lookup(&mut self, host: Option<&str>) -> &mut dyn Backend {
        let host = match host {
            None | Some("localhost") => return &mut self.local,
            Some(host) => host,
        };
        let key = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => host.to_string(),
        };
        match self.remotes.entry(key) {
            Entry::Occupied(entry) => entry.into_mut().as_mut(),
            Entry::Vacant(entry) => entry.insert(open_remote(host, &self.config)).as_mut(),
        }
    }

    /// Remote hosts currently cached.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Disconnect and forget every remote host.
    pub fn shutdown(&mut self) {
        for backend in self.remotes.values_mut() {
            backend.shutdown();
        }
        self.remotes.clear();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

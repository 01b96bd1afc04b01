//! mDNS-backed discovery radio.
//!
//! The advertised payload travels in the TXT record of a per-peer service
//! instance; scanning browses the service type and forwards every payload it
//! resolves from other instances.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::DiscoverySession;
use crate::error::{RadioError, RadioResult};

/// TXT property carrying the encoded discovery payload.
pub const PAYLOAD_PROPERTY: &str = "payload";

const DAEMON_ERROR: i32 = -1;
const INVALID_PAYLOAD: i32 = -2;

fn daemon_error(err: mdns_sd::Error) -> RadioError {
    RadioError::new(DAEMON_ERROR, err.to_string())
}

pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    instance: String,
    port: u16,
    advertised: Mutex<Option<String>>,
    discovered: broadcast::Sender<Bytes>,
}

impl MdnsDiscovery {
    /// `port` is only informational; peers read the payload, not the SRV record.
    pub fn new(service_type: impl Into<String>, port: u16) -> Result<Self, RadioError> {
        let daemon = ServiceDaemon::new().map_err(daemon_error)?;
        let simple = Uuid::new_v4().simple().to_string();
        let (discovered, _) = broadcast::channel(32);
        Ok(Self {
            daemon,
            service_type: service_type.into(),
            instance: format!("anaglyph-{}", &simple[..12]),
            port,
            advertised: Mutex::new(None),
            discovered,
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.service_type)
    }

    fn advertised(&self) -> MutexGuard<'_, Option<String>> {
        match self.advertised.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl DiscoverySession for MdnsDiscovery {
    async fn start_advertising(&self, payload: Bytes) -> RadioResult {
        let text = std::str::from_utf8(&payload)
            .map_err(|err| RadioError::new(INVALID_PAYLOAD, err.to_string()))?;
        let host = format!("{}.local.", self.instance);
        let properties = [(PAYLOAD_PROPERTY, text)];
        let service = ServiceInfo::new(
            &self.service_type,
            &self.instance,
            &host,
            "",
            self.port,
            &properties[..],
        )
        .map_err(daemon_error)?
        .enable_addr_auto();
        let fullname = service.get_fullname().to_string();

        self.daemon.register(service).map_err(daemon_error)?;
        info!(service = %fullname, "mdns service registered");
        *self.advertised() = Some(fullname);
        Ok(())
    }

    async fn stop_advertising(&self) -> RadioResult {
        let Some(fullname) = self.advertised().take() else {
            return Ok(());
        };
        self.daemon.unregister(&fullname).map_err(daemon_error)?;
        info!(service = %fullname, "mdns service unregistered");
        Ok(())
    }

    async fn start_scanning(&self) -> RadioResult {
        let receiver = self.daemon.browse(&self.service_type).map_err(daemon_error)?;
        let own = self.fullname();
        let discovered = self.discovered.clone();

        tokio::task::spawn_blocking(move || {
            for event in receiver {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        if info.get_fullname() == own {
                            continue;
                        }
                        match info.get_property_val_str(PAYLOAD_PROPERTY) {
                            Some(payload) => {
                                debug!(service = info.get_fullname(), payload, "mdns payload");
                                let _ = discovered.send(Bytes::copy_from_slice(payload.as_bytes()));
                            }
                            None => {
                                warn!(service = info.get_fullname(), "resolved service without payload")
                            }
                        }
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
        });
        Ok(())
    }

    async fn stop_scanning(&self) -> RadioResult {
        self.daemon
            .stop_browse(&self.service_type)
            .map_err(daemon_error)
    }

    fn subscribe_discovered(&self) -> broadcast::Receiver<Bytes> {
        self.discovered.subscribe()
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Err(err) = self.daemon.shutdown() {
            debug!(error = %err, "mdns daemon shutdown");
        }
    }
}

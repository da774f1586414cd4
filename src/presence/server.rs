//! Presence probe server
//!
//! Answers every request, whatever the method or path, with this node's
//! encoded presence record and closes the connection.

use actix_web::dev::ServerHandle;
use actix_web::http::KeepAlive;
use actix_web::{web, App, HttpResponse, HttpServer};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tracing::{error, info, warn};

use super::LocalPresence;
use crate::config::PresenceSettings;
use crate::metrics::record_presence_request;
use crate::models::{DiscoveryError, DiscoveryResult};

struct Running {
    handle: ServerHandle,
    addrs: Vec<SocketAddr>,
}

/// HTTP server publishing the local presence record to probing peers
pub struct PresenceServer {
    settings: PresenceSettings,
    presence: LocalPresence,
    running: Mutex<Option<Running>>,
}

impl PresenceServer {
    pub fn new(settings: PresenceSettings, presence: LocalPresence) -> Self {
        Self {
            settings,
            presence,
            running: Mutex::new(None),
        }
    }

    /// Bind and serve in the background; a second call is a no-op
    pub fn start(&self) -> DiscoveryResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let bind_addr = (self.settings.bind_host.as_str(), self.settings.port);
        let presence = web::Data::new(self.presence.clone());

        let server = HttpServer::new(move || {
            App::new()
                .app_data(presence.clone())
                .default_service(web::to(serve_presence))
        })
        .workers(self.settings.workers.max(1))
        .keep_alive(KeepAlive::Disabled)
        .disable_signals()
        .bind(bind_addr)
        .map_err(|e| {
            DiscoveryError::Configuration(format!(
                "Cannot bind presence server to {}:{}: {}",
                self.settings.bind_host, self.settings.port, e
            ))
        })?;

        let addrs = server.addrs();
        let server = server.run();
        let handle = server.handle();

        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, "Presence server error");
            }
        });

        info!(addrs = ?addrs, "Presence server started");
        *running = Some(Running { handle, addrs });
        Ok(())
    }

    /// First bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.addrs.first().copied())
    }

    /// Stop accepting probes and wait for in-flight responses
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.handle.stop(true).await;
            info!(addrs = ?running.addrs, "Presence server stopped");
        }
    }
}

impl std::fmt::Debug for PresenceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceServer")
            .field("bind_host", &self.settings.bind_host)
            .field("port", &self.settings.port)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

async fn serve_presence(presence: web::Data<LocalPresence>) -> HttpResponse {
    record_presence_request();

    match presence.snapshot().encode() {
        Ok(frame) => HttpResponse::Ok()
            .content_type("application/octet-stream")
            .force_close()
            .body(frame),
        Err(e) => {
            warn!(error = %e, "Failed to encode presence record");
            HttpResponse::InternalServerError().force_close().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PhysicalAddress, PresenceRecord};
    use futures::future::join_all;

    fn test_settings() -> PresenceSettings {
        PresenceSettings {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            workers: 1,
        }
    }

    fn presence() -> LocalPresence {
        LocalPresence::new(
            PresenceRecord::new("node-1", "one").with_address(PhysicalAddress::new("10.0.0.1", 7800)),
        )
    }

    #[actix_rt::test]
    async fn test_any_request_gets_the_record() {
        let presence = presence();
        let server = PresenceServer::new(test_settings(), presence.clone());
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let client = reqwest::Client::new();
        let body = client
            .post(format!("http://{}/whatever/path", addr))
            .body("ignored")
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(PresenceRecord::decode(&body).unwrap(), *presence.snapshot());

        presence.set_addresses([PhysicalAddress::new("10.0.0.2", 7801)]);
        let body = reqwest::get(format!("http://{}/", addr))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let record = PresenceRecord::decode(&body).unwrap();
        assert!(record.addresses.contains(&PhysicalAddress::new("10.0.0.2", 7801)));

        server.stop().await;
    }

    #[actix_rt::test]
    async fn test_concurrent_probes() {
        let server = PresenceServer::new(test_settings(), presence());
        server.start().unwrap();
        let url = format!("http://{}/", server.local_addr().unwrap());

        let client = reqwest::Client::new();
        let probes = (0..16).map(|_| {
            let client = client.clone();
            let url = url.clone();
            async move { client.get(&url).send().await?.bytes().await }
        });

        for body in join_all(probes).await {
            let record = PresenceRecord::decode(&body.unwrap()).unwrap();
            assert_eq!(record.node_id, "node-1");
        }

        server.stop().await;
    }

    #[actix_rt::test]
    async fn test_probe_fails_after_stop() {
        let server = PresenceServer::new(test_settings(), presence());
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        server.stop().await;
        server.stop().await;

        assert!(server.local_addr().is_none());
        assert!(reqwest::get(format!("http://{}/", addr)).await.is_err());
    }
}

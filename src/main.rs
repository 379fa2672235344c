use std::env;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::{info, warn};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use warp::Filter;

use room_relay::server::Server;

fn load_tls_config(cert_path: &str, key_path: &str) -> Option<ServerConfig> {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("failed to open certificate file {}: {}", cert_path, e);
            return None;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("failed to open private key file {}: {}", key_path, e);
            return None;
        }
    };

    let cert_reader = &mut BufReader::new(cert_file);
    let key_reader = &mut BufReader::new(key_file);

    let certs: Vec<CertificateDer<'static>> = match certs(cert_reader).collect() {
        Ok(certs) => certs,
        Err(e) => {
            warn!("failed to parse certificate: {}", e);
            return None;
        }
    };

    let keys: Vec<PrivatePkcs8KeyDer<'static>> = match pkcs8_private_keys(key_reader).collect() {
        Ok(keys) => keys,
        Err(e) => {
            warn!("failed to parse private key: {}", e);
            return None;
        }
    };
    let Some(key) = keys.into_iter().next() else {
        warn!("no private key found in {}", key_path);
        return None;
    };

    match ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
    {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("failed to build TLS config: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(2052);
    let cert_path = env::var("TLS_CERT_PATH").unwrap_or_else(|_| "ssl/certificate.pem".to_string());
    let key_path = env::var("TLS_KEY_PATH").unwrap_or_else(|_| "ssl/private.key".to_string());

    let server = Arc::new(Server::new());

    let ws_route = warp::path!("ws" / String / String)
        .and(warp::ws())
        .map(move |room: String, username: String, ws: warp::ws::Ws| {
            let server = server.clone();
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(room, username, socket).await;
            })
        });

    let static_files = warp::fs::dir("public");

    let routes = ws_route
        .or(static_files)
        .with(warp::cors().allow_any_origin());

    match load_tls_config(&cert_path, &key_path) {
        Some(_) => {
            info!("starting secure server (https/wss) on port {}", port);
            warp::serve(routes)
                .tls()
                .cert_path(&cert_path)
                .key_path(&key_path)
                .run(([0, 0, 0, 0], port))
                .await;
        }
        None => {
            warn!("TLS config unavailable, serving plain http/ws on port {}", port);
            warp::serve(routes).run(([0, 0, 0, 0], port)).await;
        }
    }
}

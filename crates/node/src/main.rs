//! pbtc-node: entry point for the passive Bitcoin crawler.
//!
//! Loads config, wires the repository, writers, recorders and the
//! connection manager, then runs until SIGINT. Shutdown is ordered:
//! manager first (no more peers feeding records), then repository,
//! then the writers. A second SIGINT during shutdown aborts.
//!
//! Exit codes: 0 clean, 1 logger init, 2 repository init, 3 writer init,
//! 4 recorder/manager init.

use pbtc_config::{Compression, RecordFormat, WriterKind};
use pbtc_net::{Manager, ManagerConfig};
use pbtc_recorder::{Recorder, RecorderOptions, Writer};
use pbtc_repo::{RepoConfig, Repository};
use pbtc_writer::{FileWriter, FileWriterOptions, Lz4Compressor, ZmqWriter};
use std::net::IpAddr;
use std::process::exit;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Duration;

#[tokio::main]
async fn main() {
    if !pbtc_metrics::init_tracing() {
        eprintln!("could not initialize logging");
        exit(1);
    }

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "pbtc.yaml".to_string());
    let config = match pbtc_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("could not load config from {}: {}", config_path, e);
            exit(2);
        }
    };
    tracing::info!("starting pbtc on {}", config.network);

    // Repository.
    let repo = match Repository::new(RepoConfig {
        seeds: config.repository.seeds.clone(),
        default_port: config.network.default_port(),
        node_limit: config.repository.node_limit,
        backup_path: config.repository.backup_path.clone(),
        backup_rate: Duration::from_secs(config.repository.backup_rate_secs),
        restore: config.repository.restore,
        rng_seed: None,
    }) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            tracing::error!("unable to create repository: {}", e);
            exit(2);
        }
    };

    // Writers.
    let file_writer = match &config.file_writer {
        Some(fw) => {
            let compressor = match fw.compression {
                Compression::Lz4 => Some(Box::new(Lz4Compressor) as Box<dyn pbtc_writer::Compressor>),
                Compression::None => None,
            };
            match FileWriter::open(FileWriterOptions {
                path: fw.path.clone(),
                size_limit: fw.size_limit,
                age_limit: Duration::from_secs(fw.age_limit_secs),
                compressor,
            }) {
                Ok(writer) => Some(Arc::new(writer)),
                Err(e) => {
                    tracing::error!("unable to initialize file writer: {}", e);
                    exit(3);
                }
            }
        }
        None => None,
    };

    let zmq_writer = match &config.zmq_writer {
        Some(zw) => match ZmqWriter::bind(zw.port, zw.high_water_mark) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(e) => {
                tracing::error!("unable to initialize zmq writer: {}", e);
                exit(3);
            }
        },
        None => None,
    };

    // Recorders.
    let mut recorders = Vec::new();
    for (i, rec) in config.recorders.iter().enumerate() {
        let mut ips = Vec::new();
        for raw in &rec.ips {
            match raw.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(e) => {
                    tracing::error!("recorder {}: bad IP filter {:?}: {}", i, raw, e);
                    exit(4);
                }
            }
        }

        let mut writers: Vec<Arc<dyn Writer>> = Vec::new();
        for kind in &rec.writers {
            match kind {
                WriterKind::File => match &file_writer {
                    Some(w) => writers.push(w.clone()),
                    None => {
                        tracing::error!("recorder {} names an unconfigured file writer", i);
                        exit(4);
                    }
                },
                WriterKind::Zmq => match &zmq_writer {
                    Some(w) => writers.push(w.clone()),
                    None => {
                        tracing::error!("recorder {} names an unconfigured zmq writer", i);
                        exit(4);
                    }
                },
            }
        }

        recorders.push(Arc::new(Recorder::new(
            RecorderOptions {
                commands: rec.commands.clone(),
                addresses: rec.addresses.clone(),
                ips,
                format: match rec.format {
                    RecordFormat::Text => pbtc_recorder::RecordFormat::Text,
                    RecordFormat::Binary => pbtc_recorder::RecordFormat::Binary,
                },
            },
            config.network.btc_network(),
            writers,
        )));
    }

    // Manager.
    let manager = Arc::new(Manager::new(
        ManagerConfig {
            chain: config.network,
            protocol_version: config.protocol_version,
            user_agent: config.user_agent.clone(),
            connection_rate: config.connection_rate,
            information_rate: Duration::from_secs(config.information_rate_secs),
            peer_limit: config.peer_limit,
            port: config.network.default_port(),
            ..ManagerConfig::default()
        },
        repo.clone(),
        recorders,
    ));

    // Optional metrics endpoint.
    if let Some(port) = config.metrics_port {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        tokio::spawn(async move {
            if let Err(e) = pbtc_metrics::serve_metrics(addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    repo.start().await;
    manager.start().await;
    tracing::info!("all modules started");

    // Wait for signals.
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("could not install signal handler: {}", e);
            exit(1);
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("could not install signal handler: {}", e);
            exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sighup.recv() => {
                // Reserved for config reload.
                tracing::info!("SIGHUP caught, ignoring");
            }
        }
    }
    tracing::info!("SIGINT caught, shutting down");

    // Ordered shutdown, aborted by a second SIGINT so a wedged teardown
    // is visible instead of silent.
    let shutdown = async {
        manager.stop().await;
        repo.stop().await;
        if let Some(writer) = &file_writer {
            writer.stop().await;
        }
        if let Some(writer) = &zmq_writer {
            writer.stop().await;
        }
    };

    tokio::select! {
        _ = shutdown => {
            tracing::info!("all modules shut down");
        }
        _ = sigint.recv() => {
            tracing::error!("shutdown interrupted");
            exit(1);
        }
    }

    exit(0);
}

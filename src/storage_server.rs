use crate::association::{AssociationSession, ScpError, StorageListener, remove_partial_files};
use crate::config::ScpConfig;

use dicom_ul::pdu::{Pdu, read_pdu, write_pdu};
use std::{
    fs,
    future::Future,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use web_time::Instant;

/// Largest PDU the upper layer decoder accepts.
const ABSOLUTE_MAX_PDU_LENGTH: u32 = 131_072;
const MIN_PDU_LENGTH: u32 = 4096;
const PDU_HEADER_LENGTH: usize = 6;

/// A C-STORE / C-ECHO service provider listening on TCP.
pub struct StorageServer {
    config: Arc<ScpConfig>,
    listener: TcpListener,
    storage_listener: Arc<dyn StorageListener>,
    received_total: Arc<AtomicUsize>,
}

impl StorageServer {
    /// Prepares the storage root and binds `0.0.0.0:<port>`.
    ///
    /// Working files left over from an earlier run are removed from the top
    /// level of the storage root.
    pub async fn bind(
        config: ScpConfig,
        storage_listener: Arc<dyn StorageListener>,
    ) -> Result<Self, ScpError> {
        fs::create_dir_all(&config.storage_root)?;
        let removed = remove_partial_files(&config.storage_root, |_| true)?;
        if removed > 0 {
            info!("Removed {removed} stale partial files from {}", config.storage_root.display());
        }

        let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        let listener = TcpListener::bind(listen_addr).await?;
        info!(
            "{} listening on: tcp://{}",
            config.ae_title,
            listener.local_addr()?
        );

        Ok(Self {
            config: Arc::new(config),
            listener,
            storage_listener,
            received_total: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Objects stored since the server started, over all associations.
    pub fn received_count(&self) -> usize {
        self.received_total.load(Ordering::SeqCst)
    }

    pub fn received_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.received_total)
    }

    /// Accepts connections until `shutdown` completes. Each association is
    /// served on the blocking pool.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ScpError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break;
                }
                result = self.listener.accept() => {
                    let (socket, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("Failed to accept connection: {err}");
                            continue;
                        }
                    };
                    let stream = socket.into_std()?;
                    stream.set_nonblocking(false)?;

                    let session = AssociationSession::new(
                        Arc::clone(&self.config),
                        Arc::clone(&self.storage_listener),
                        Arc::clone(&self.received_total),
                        peer.to_string(),
                    );
                    let config = Arc::clone(&self.config);
                    tokio::task::spawn_blocking(move || {
                        if let Err(err) = serve_connection(stream, session, &config) {
                            warn!("{peer}: {err}");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// Runs one association to completion over a blocking stream.
pub fn serve_connection(
    mut stream: impl Read + Write,
    mut session: AssociationSession,
    config: &ScpConfig,
) -> Result<(), ScpError> {
    let started = Instant::now();
    loop {
        let pdu = match read_pdu_from(&mut stream, config.max_pdu_length, config.strict) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => {
                session.connection_closed();
                return Ok(());
            }
            Err(err) => {
                session.connection_closed();
                return Err(err);
            }
        };

        for reply in session.handle(pdu) {
            write_pdu_to(&mut stream, &reply)?;
        }

        if session.state().is_closed() {
            info!(
                "Association {} ended ({:?}) after {:?}",
                session.id(),
                session.state(),
                started.elapsed()
            );
            return Ok(());
        }
    }
}

/// Reads one whole PDU. `None` on a clean end of stream.
pub fn read_pdu_from(
    stream: &mut impl Read,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Option<Pdu>, ScpError> {
    let mut buffer = vec![0u8; PDU_HEADER_LENGTH];
    match stream.read_exact(&mut buffer) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);
    let limit = if strict && max_pdu_length > 0 {
        max_pdu_length
    } else {
        ABSOLUTE_MAX_PDU_LENGTH
    };
    if length > limit {
        return Err(ScpError::PduTooLarge { length, limit });
    }

    buffer.resize(PDU_HEADER_LENGTH + length as usize, 0);
    stream.read_exact(&mut buffer[PDU_HEADER_LENGTH..])?;

    let max_pdu_length = if max_pdu_length == 0 {
        ABSOLUTE_MAX_PDU_LENGTH
    } else {
        max_pdu_length.clamp(MIN_PDU_LENGTH, ABSOLUTE_MAX_PDU_LENGTH)
    };
    read_pdu(&mut buffer.as_slice(), max_pdu_length, strict)
        .map_err(|err| ScpError::Pdu(err.to_string()))?
        .map(Some)
        .ok_or_else(|| ScpError::Pdu("incomplete PDU".to_string()))
}

pub fn write_pdu_to(stream: &mut impl Write, pdu: &Pdu) -> Result<(), ScpError> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu).map_err(|err| ScpError::Pdu(err.to_string()))?;
    stream.write_all(&buffer)?;
    stream.flush()?;
    Ok(())
}
